//! # Storage - Persistent Section Store
//!
//! Carves a single page-addressed [`Eeprom`] into named, versioned sections,
//! keeps the whole device mirrored in RAM, and writes changes back lazily from
//! a dedicated background thread.
//!
//! ## Architecture
//!
//! ```text
//! caller threads                                 flush worker thread
//!   |                                                    |
//!   | get_section(id, version, size)                     | load device -> shadow, live
//!   |   -> Section handle into `live`                    | validate / format header
//!   |                                                    | open load gate
//!   | section.write_from(..)                             |
//!   | section.flush(cb) ──► FlushQueue (priority heap) ──► pop highest
//!   |                                                    |   verify shadow checksums
//!   |                                                    |   diff live vs shadow per page
//!   |                                                    |   write dirty pages, update shadow
//!   | <──────────────────── completion callback ─────────|
//!   |                                                    | idle > flush_interval:
//!   |                                                    |   synthesize full-device flush
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                    |
//! |-----------------|------------------------------------------------------------|
//! | [`lib.rs`]      | `PersistentStorage` struct, constructor, accessors, `Drop`  |
//! | [`section`]     | Section handles, lookup/allocation/deletion, version updates |
//! | [`flush`]       | Flush requests, priority queue, `flush*` / `sync*` API      |
//! | [`worker`]      | Background loop, page diffing and write-back               |
//! | [`recovery`]    | Initial device load, header validation and formatting      |
//! | [`cache`]       | Shadow mirror with per-page integrity checksums            |
//! | [`priority`]    | Caller priorities and worker priority inheritance          |
//! | [`variable`]    | Length-prefixed blobs on top of one section                |
//! | [`allocations`] | Registry of well-known section ids                         |
//!
//! ## Locking
//!
//! The live image lock doubles as the index lock: the index lives inside the
//! image, and index operations only scan and patch memory while holding it.
//! The flush queue has its own lock. No code path holds both; index
//! mutations release the image before they enqueue their index flush.
//!
//! ## Integrity
//!
//! The shadow mirror keeps a CRC32 per page. Before a request is serviced the
//! checksums of its pages are verified; a mismatch means memory corruption,
//! and flushing is disabled for the rest of the process lifetime rather than
//! risk writing garbage to the device.

pub mod allocations;
mod cache;
mod flush;
pub mod priority;
mod recovery;
mod section;
pub mod variable;
pub mod watchdog;
mod worker;

pub use eeprom::Eeprom;
pub use flush::Completion;
pub use index::IndexRecord;
pub use priority::Priority;
pub use section::Section;
pub use variable::VariablePersistentAllocation;
pub use watchdog::{SlotHandle, Watchdog};

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cache::Shadow;
use config::{ConfigError, StorageConfig};
use flush::FlushQueue;
use index::{Geometry, GeometryError};
use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{error, info};

/// Errors surfaced by the storage service.
///
/// Section lookups never return these: a failed [`PersistentStorage::get_section`]
/// is logged and yields `None`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The device cannot be addressed by the 16-bit index.
    #[error("unsupported device geometry: {0}")]
    Geometry(#[from] GeometryError),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The background worker thread could not be started.
    #[error("failed to spawn flush worker: {0}")]
    Spawn(#[source] io::Error),

    /// A flush was requested for bytes outside the device.
    #[error("flush of {len} bytes at {start} exceeds device size {size}")]
    RangeOutOfBounds {
        /// First byte of the range.
        start: usize,
        /// Length of the range.
        len: usize,
        /// Device size.
        size: usize,
    },

    /// An access through a [`Section`] ran past its capacity.
    #[error("access of {len} bytes at {at} exceeds section capacity {capacity}")]
    SectionBounds {
        /// Offset inside the section.
        at: usize,
        /// Length of the access.
        len: usize,
        /// Section capacity in bytes.
        capacity: usize,
    },

    /// Flushing was disabled after an integrity fault or an unreadable device.
    #[error("persistent storage flushing is halted")]
    Halted,

    /// A bounded wait for flush completion expired.
    #[error("timed out waiting for flush completion")]
    Timeout,

    /// The section exists with a version the caller does not understand.
    #[error("section 0x{id:04x} has unsupported version {found}")]
    ForeignVersion {
        /// Section id.
        id: u16,
        /// Version found in the index.
        found: u16,
    },

    /// The payload does not fit the 16-bit section size.
    #[error("payload of {0} bytes is too large")]
    TooLarge(usize),

    /// No free range was available for the section.
    #[error("unable to allocate section 0x{0:04x}")]
    AllocationFailed(u16),

    /// The section content is inconsistent with its own length prefix.
    #[error("section 0x{0:04x} is corrupt")]
    Corrupt(u16),

    /// The handle outlived its section: the id was deleted or moved.
    #[error("section 0x{0:04x} no longer exists at this location")]
    StaleSection(u16),
}

/// Counters describing what the flush worker has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Requests dequeued, including ones discarded after a halt.
    pub requests: u64,
    /// Pages successfully written to the device.
    pub pages_written: u64,
    /// Page writes that failed or came back short.
    pub write_failures: u64,
    /// Full-device flushes synthesized by the idle timer.
    pub background_flushes: u64,
}

/// One-shot gate opened once the initial device load has completed.
#[derive(Debug, Default)]
pub(crate) struct LoadGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl LoadGate {
    pub(crate) fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    pub(crate) fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

/// State shared between the public handle and the flush worker.
pub(crate) struct Shared {
    pub(crate) eeprom: Arc<dyn Eeprom>,
    pub(crate) geometry: Geometry,
    pub(crate) config: StorageConfig,
    /// The buffer sections read and write; also guards the index inside it.
    pub(crate) live: RwLock<Vec<u8>>,
    /// Last content known to be on the device.
    pub(crate) shadow: Mutex<Shadow>,
    pub(crate) queue: Mutex<FlushQueue>,
    /// Signalled whenever the queue gains work or shutdown is requested.
    pub(crate) wake: Condvar,
    pub(crate) loaded: LoadGate,
    pub(crate) halted: AtomicBool,
    pub(crate) worker_priority: AtomicU32,
    pub(crate) stats: Mutex<FlushStats>,
    pub(crate) watchdog: Option<(Arc<dyn Watchdog>, SlotHandle)>,
}

impl Shared {
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn set_worker_priority(&self, priority: Priority) {
        self.worker_priority.store(priority.0, Ordering::Release);
    }

    /// Raises the worker to at least `priority`; never lowers it.
    pub(crate) fn raise_worker_priority(&self, priority: Priority) {
        self.worker_priority.fetch_max(priority.0, Ordering::AcqRel);
    }
}

/// The persistent storage service.
///
/// Construct one per device at startup and share it by reference (or inside
/// an `Arc`) with every consumer. [`Section`] handles borrow it, so it always
/// outlives them.
///
/// # Write Path
///
/// 1. [`get_section`](Self::get_section) finds or allocates the section and
///    returns a handle into the live buffer.
/// 2. The caller mutates the section through the handle.
/// 3. The caller requests a flush, optionally with a completion callback (or
///    uses a blocking `sync*` form).
/// 4. The worker writes the dirty pages and then runs the callback.
///
/// # Shutdown
///
/// Dropping the storage drains every queued request, performs a final full
/// flush, and joins the worker.
pub struct PersistentStorage {
    pub(crate) shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PersistentStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sections = {
            let live = self.shared.live.read();
            index::record_count(&live)
        };
        f.debug_struct("PersistentStorage")
            .field("total_size", &self.shared.geometry.total_size())
            .field("page_size", &self.shared.geometry.page_size())
            .field("loaded", &self.shared.loaded.is_open())
            .field("sections", &sections)
            .field("pending_flushes", &self.shared.queue.lock().len())
            .field("worker_priority", &self.worker_priority())
            .field("halted", &self.shared.is_halted())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PersistentStorage {
    /// Starts a storage service on `eeprom`.
    ///
    /// Geometry and configuration are validated before the worker thread is
    /// spawned; the device is then loaded on the worker in the background.
    /// Every section operation waits for that load to finish.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Geometry`] if the device has more than 65535 pages or
    ///   is otherwise unusable.
    /// - [`StorageError::Config`] if `config` fails validation.
    /// - [`StorageError::Spawn`] if the worker thread cannot be created.
    pub fn new(eeprom: Arc<dyn Eeprom>, config: StorageConfig) -> Result<Self, StorageError> {
        Self::build(eeprom, config, None)
    }

    /// Like [`new`](Self::new), additionally registering a watchdog slot that
    /// the worker services once per request.
    pub fn with_watchdog(
        eeprom: Arc<dyn Eeprom>,
        config: StorageConfig,
        watchdog: Arc<dyn Watchdog>,
    ) -> Result<Self, StorageError> {
        Self::build(eeprom, config, Some(watchdog))
    }

    fn build(
        eeprom: Arc<dyn Eeprom>,
        config: StorageConfig,
        watchdog: Option<Arc<dyn Watchdog>>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let geometry = Geometry::new(eeprom.total_size(), eeprom.page_size())?;

        info!(
            target: "pstore::storage",
            total_size = geometry.total_size(),
            page_size = geometry.page_size(),
            "persistent storage starting"
        );

        let watchdog = watchdog.map(|wd| {
            let slot = wd.register_slot(config.watchdog_budget());
            wd.activate_slot(slot);
            (wd, slot)
        });

        let shared = Arc::new(Shared {
            eeprom,
            geometry,
            live: RwLock::new(vec![0u8; geometry.total_size()]),
            shadow: Mutex::new(Shadow::new(geometry)),
            queue: Mutex::new(FlushQueue::default()),
            wake: Condvar::new(),
            loaded: LoadGate::default(),
            halted: AtomicBool::new(false),
            // the worker runs as a driver until the initial load completes
            worker_priority: AtomicU32::new(Priority::DRIVER.0),
            stats: Mutex::new(FlushStats::default()),
            watchdog,
            config,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(shared.config.worker_name.clone())
            .spawn(move || worker::run(worker_shared))
            .map_err(StorageError::Spawn)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Blocks until the initial device load and header validation are done.
    pub fn wait_loaded(&self) {
        self.shared.loaded.wait();
    }

    /// Device size in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.shared.geometry.total_size()
    }

    /// Device page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.shared.geometry.page_size()
    }

    /// Page geometry of the underlying device.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Snapshot of the worker's counters.
    #[must_use]
    pub fn stats(&self) -> FlushStats {
        *self.shared.stats.lock()
    }

    /// Priority the worker is currently running at.
    #[must_use]
    pub fn worker_priority(&self) -> Priority {
        Priority(self.shared.worker_priority.load(Ordering::Acquire))
    }

    /// Whether flushing has been permanently disabled.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }
}

/// Drains the queue and performs a final flush before the worker exits.
///
/// Requests are never cancelled: anything enqueued before the drop is still
/// written, and its completion callback still runs.
impl Drop for PersistentStorage {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(target: "pstore::storage", "flush worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests;
