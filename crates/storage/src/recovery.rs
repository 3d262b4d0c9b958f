//! Initial device load.
//!
//! Runs once on the worker thread before anything else:
//!
//! 1. Read the whole device into the shadow mirror.
//! 2. Copy it into the live buffer, formatting the header and index if the
//!    header is blank or carries a version this build does not understand.
//! 3. Open the load gate so callers may proceed.
//! 4. Schedule an index flush if the image was formatted.
//!
//! A device that cannot be read is never written: the in-memory image is
//! formatted so callers still work, but flushing is halted.

use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use eeprom::ERASED_BYTE;
use index::HeaderState;
use tracing::{error, info, warn};

use crate::priority::Priority;
use crate::Shared;

impl Shared {
    pub(crate) fn load(&self) {
        let mut image = vec![0u8; self.geometry.total_size()];

        let formatted = {
            let mut shadow = self.shadow.lock();
            let mut live = self.live.write();

            if let Err(err) = self.read_device(&mut image) {
                error!(
                    target: "pstore::recovery",
                    error = %format!("{err:#}"),
                    "unable to read persistent storage, flushing disabled"
                );
                self.halted.store(true, Ordering::Release);
                image.fill(ERASED_BYTE);
            }
            shadow.load(&image);

            let formatted = match HeaderState::classify(index::header_version(&image)) {
                HeaderState::Valid => false,
                HeaderState::Uninitialized => {
                    info!(target: "pstore::recovery", "formatting uninitialized persistent storage");
                    true
                }
                HeaderState::Unrecognized(version) => {
                    error!(
                        target: "pstore::recovery",
                        version,
                        "unrecognized persistent storage format, reformatting"
                    );
                    true
                }
            };
            if formatted {
                index::format_image(&mut image);
            }
            live.copy_from_slice(&image);
            formatted
        };

        self.loaded.open();

        if formatted {
            self.flush_index();
        } else {
            self.trace_index();
        }
        self.set_worker_priority(Priority::BACKGROUND);

        let sections = index::record_count(&self.live.read());
        if self.is_halted() {
            warn!(target: "pstore::recovery", sections, "persistent storage loaded read-only");
        } else {
            info!(target: "pstore::recovery", sections, formatted, "persistent storage loaded");
        }
    }

    fn read_device(&self, image: &mut [u8]) -> Result<()> {
        let read = self
            .eeprom
            .read(0, image)
            .context("reading persistent storage image")?;
        if read != image.len() {
            bail!("short read of persistent storage: {read} of {} bytes", image.len());
        }
        Ok(())
    }
}
