//! File-backed device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::{check_range, Eeprom, EepromError, ERASED_BYTE};

/// An [`Eeprom`] stored in a regular file of exactly `total_size` bytes.
///
/// A missing file is created and filled with the erased pattern. When `sync`
/// is `true`, every write is followed by `sync_data()` so that a returned
/// write count means the page reached stable storage.
#[derive(Debug)]
pub struct FileEeprom {
    path: PathBuf,
    file: Mutex<File>,
    total_size: usize,
    page_size: usize,
    sync: bool,
}

impl FileEeprom {
    /// Opens (or creates) a device image at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - image file, created if it does not exist.
    /// * `total_size` - device size in bytes; a shorter existing file is
    ///   extended with erased bytes.
    /// * `page_size` - page size reported to the storage layer.
    /// * `sync` - if true, every `write` is followed by `sync_data`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        total_size: usize,
        page_size: usize,
        sync: bool,
    ) -> Result<Self, EepromError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let existing = file.metadata()?.len() as usize;
        if existing < total_size {
            // Pad with the erased pattern so a new image reads as blank.
            file.seek(SeekFrom::Start(existing as u64))?;
            file.write_all(&vec![ERASED_BYTE; total_size - existing])?;
            file.sync_all()?;
            debug!(
                target: "pstore::eeprom",
                path = %path.display(),
                padded = total_size - existing,
                "initialized device image"
            );
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            total_size,
            page_size,
            sync,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Eeprom for FileEeprom {
    fn total_size(&self) -> usize {
        self.total_size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, EepromError> {
        check_range(offset, buf.len(), self.total_size)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(buf)?;
        Ok(buf.len())
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, EepromError> {
        check_range(offset, buf.len(), self.total_size)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(buf)?;
        file.flush()?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(buf.len())
    }
}
