//! Section lookup, allocation and handles.

use std::ops::Range;

use index::{IndexRecord, END_OF_INDEX};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockUpgradableReadGuard,
    RwLockWriteGuard,
};
use tracing::{debug, error, info, trace, warn};

use crate::allocations;
use crate::flush::Completion;
use crate::{PersistentStorage, Shared, StorageError};

/// Header version that marks an image as uninitialized.
const DEINITIALIZED: u16 = 0xFFFF;

/// A handle to one section of the live buffer.
///
/// The handle is a view: reads and writes go straight to the shared live
/// buffer, and nothing reaches the device until the section is flushed.
/// Concurrent writers to overlapping bytes of the same section must
/// coordinate among themselves.
///
/// Every access first checks, under the live lock, that the index still
/// places this id on the same pages. Once the section has been deleted (or
/// deleted and its pages given to another id) the handle only returns
/// [`StorageError::StaleSection`].
#[derive(Clone, Copy)]
pub struct Section<'a> {
    storage: &'a PersistentStorage,
    record: IndexRecord,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for Section<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("record", &self.record)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl<'a> Section<'a> {
    fn new(storage: &'a PersistentStorage, record: IndexRecord) -> Self {
        let page_size = storage.page_size();
        Self {
            storage,
            record,
            offset: record.byte_offset(page_size),
            len: record.byte_len(page_size),
        }
    }

    /// Section id.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.record.id
    }

    /// Version the section had when this handle was obtained.
    #[must_use]
    pub fn version(&self) -> u16 {
        self.record.version
    }

    /// Index record the handle was created from.
    #[must_use]
    pub fn record(&self) -> IndexRecord {
        self.record
    }

    /// Byte offset of the section on the device.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Capacity in bytes: always whole pages, so at least the requested size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the section has no capacity. Never true for allocated sections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the index still holds this section at the same place.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.check(&self.storage.shared.live.read()).is_ok()
    }

    /// Fails unless `live` still maps this id onto the handle's pages.
    /// A version change keeps the placement and the handle.
    fn check(&self, live: &[u8]) -> Result<(), StorageError> {
        match index::find(live, self.record.id) {
            Some((_, rec))
                if rec.page_offset == self.record.page_offset
                    && rec.page_count == self.record.page_count =>
            {
                Ok(())
            }
            _ => Err(StorageError::StaleSection(self.record.id)),
        }
    }

    fn absolute(&self, at: usize, len: usize) -> Result<Range<usize>, StorageError> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.offset + at..self.offset + end),
            _ => Err(StorageError::SectionBounds {
                at,
                len,
                capacity: self.len,
            }),
        }
    }

    /// Copies `buf.len()` bytes starting `at` bytes into the section.
    pub fn read_into(&self, at: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.absolute(at, buf.len())?;
        let live = self.storage.shared.live.read();
        self.check(&live)?;
        buf.copy_from_slice(&live[range]);
        Ok(())
    }

    /// Copies `data` into the section starting `at` bytes in.
    pub fn write_from(&self, at: usize, data: &[u8]) -> Result<(), StorageError> {
        let range = self.absolute(at, data.len())?;
        let mut live = self.storage.shared.live.write();
        self.check(&live)?;
        live[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy of the whole section.
    pub fn to_vec(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.bytes()?.to_vec())
    }

    /// Borrows the section's bytes in place.
    ///
    /// Flushes keep working while the lease is held; index changes and
    /// writers wait for it.
    pub fn bytes(&self) -> Result<MappedRwLockReadGuard<'a, [u8]>, StorageError> {
        let live = self.storage.shared.live.read();
        self.check(&live)?;
        let range = self.offset..self.offset + self.len;
        Ok(RwLockReadGuard::map(live, move |live| &live[range]))
    }

    /// Mutably borrows the section's bytes in place.
    ///
    /// Holds the live buffer exclusively; keep the lease short, and do not
    /// call back into the storage while holding it.
    pub fn bytes_mut(&self) -> Result<MappedRwLockWriteGuard<'a, [u8]>, StorageError> {
        let live = self.storage.shared.live.write();
        self.check(&live)?;
        let range = self.offset..self.offset + self.len;
        Ok(RwLockWriteGuard::map(live, move |live| &mut live[range]))
    }

    fn ensure_live(&self) -> Result<(), StorageError> {
        self.check(&self.storage.shared.live.read())
    }

    /// Schedules the whole section for write-back.
    pub fn flush(&self, complete: Option<Completion>) -> Result<(), StorageError> {
        self.ensure_live()?;
        self.storage.flush_range(self.offset, self.len, complete)
    }

    /// Schedules `len` bytes starting `at` bytes into the section.
    pub fn flush_part(
        &self,
        at: usize,
        len: usize,
        complete: Option<Completion>,
    ) -> Result<(), StorageError> {
        let range = self.absolute(at, len)?;
        self.ensure_live()?;
        self.storage.flush_range(range.start, len, complete)
    }

    /// Writes back the whole section and waits until it is durable.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.ensure_live()?;
        self.storage.sync_range(self.offset, self.len)
    }
}

impl PersistentStorage {
    /// Version of section `id`, or `0` if it does not exist.
    pub fn get_section_version(&self, id: u16) -> u16 {
        self.wait_loaded();
        let live = self.shared.live.read();
        index::find(&live, id).map_or(0, |(_, rec)| rec.version)
    }

    /// Changes the version of section `id`. Does nothing if it does not exist.
    pub fn set_section_version(&self, id: u16, version: u16) {
        self.wait_loaded();
        let updated = {
            let mut live = self.shared.live.write();
            index::set_version(&mut live, id, version)
        };
        if updated == 0 {
            trace!(target: "pstore::section", id, "set_section_version on absent section");
            return;
        }
        debug!(target: "pstore::section", id, version, "section version updated");
        self.shared.flush_index();
    }

    /// Looks up section `id`, allocating `size` bytes for it if it is absent.
    ///
    /// An existing section is returned only if its version equals `version`
    /// and it has at least as many pages as `size` needs; to change either,
    /// delete it first. Returns `None` (after logging why) on mismatch, on
    /// the reserved id `0`, on version `0`, or when no free range is left.
    pub fn get_section(&self, id: u16, version: u16, size: u16) -> Option<Section<'_>> {
        self.wait_loaded();
        if id == END_OF_INDEX {
            warn!(target: "pstore::section", "section id 0x0000 is reserved");
            return None;
        }
        if version == 0 {
            warn!(target: "pstore::section", id, "section version 0 is reserved");
            return None;
        }

        let geometry = self.shared.geometry;
        let needed = geometry.pages_for(usize::from(size));

        let live = self.shared.live.upgradable_read();
        if let Some((_, rec)) = index::find(&live, id) {
            if rec.version != version {
                error!(
                    target: "pstore::section",
                    id,
                    stored = rec.version,
                    requested = version,
                    "section version mismatch"
                );
                return None;
            }
            if usize::from(rec.page_count) < needed {
                error!(
                    target: "pstore::section",
                    id,
                    stored_pages = rec.page_count,
                    needed_pages = needed,
                    "section is smaller than requested"
                );
                return None;
            }
            return Some(Section::new(self, rec));
        }

        let records = index::records(&live);
        let Some(page_offset) = index::plan_allocation(&records, &geometry, needed) else {
            error!(
                target: "pstore::section",
                id,
                size,
                needed_pages = needed,
                sections = records.len(),
                "unable to allocate section"
            );
            return None;
        };
        let Ok(page_count) = u16::try_from(needed) else {
            return None;
        };
        let rec = IndexRecord {
            id,
            page_offset,
            page_count,
            version,
        };

        let mut live = RwLockUpgradableReadGuard::upgrade(live);
        if let Err(err) = index::append(&mut live, &rec) {
            error!(target: "pstore::section", id, error = %err, "unable to extend index");
            return None;
        }
        drop(live);

        info!(
            target: "pstore::section",
            id,
            version,
            page_offset,
            page_count,
            "section allocated"
        );
        self.shared.flush_index();
        Some(Section::new(self, rec))
    }

    /// Deletes every record for `id`, returning whether any existed.
    ///
    /// The pages are not scrubbed.
    pub fn delete_section(&self, id: u16) -> bool {
        self.wait_loaded();
        let removed = {
            let mut live = self.shared.live.write();
            index::remove(&mut live, id)
        };
        match removed.len() {
            0 => return false,
            1 => debug!(target: "pstore::section", id, "section deleted"),
            n => warn!(target: "pstore::section", id, records = n, "deleted duplicate section records"),
        }
        self.shared.flush_index();
        true
    }

    /// Snapshot of the index.
    pub fn list_sections(&self) -> Vec<IndexRecord> {
        self.wait_loaded();
        index::records(&self.shared.live.read())
    }

    /// Marks the device uninitialized so it is formatted on the next start.
    ///
    /// The in-memory index keeps working until then.
    pub fn deinitialize(&self) {
        self.wait_loaded();
        {
            let mut live = self.shared.live.write();
            index::set_header_version(&mut live, DEINITIALIZED);
        }
        warn!(target: "pstore::section", "persistent storage deinitialized");
        self.shared.flush_index();
    }
}

impl Shared {
    /// Dumps the index at trace level.
    pub(crate) fn trace_index(&self) {
        if !tracing::enabled!(target: "pstore::index", tracing::Level::TRACE) {
            return;
        }
        let (version, records) = {
            let live = self.live.read();
            (index::header_version(&live), index::records(&live))
        };
        trace!(target: "pstore::index", version, sections = records.len(), "index");
        for rec in records {
            trace!(
                target: "pstore::index",
                id = %format!("{:#06x}", rec.id),
                name = allocations::name_of(rec.id).unwrap_or("unknown"),
                page_offset = rec.page_offset,
                page_count = rec.page_count,
                version = rec.version,
                "section"
            );
        }
    }
}
