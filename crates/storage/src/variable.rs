//! Variable-length blobs stored in a single section.
//!
//! ```text
//! [len: u16 LE][payload: len bytes][unused up to the page boundary]
//! ```
//!
//! The section is written with record version [`RECORD_VERSION`]; a section
//! under the same id with any other version belongs to someone else and is
//! left alone.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::flush::Completion;
use crate::{PersistentStorage, StorageError};

/// Record version of sections written by [`VariablePersistentAllocation`].
pub const RECORD_VERSION: u16 = 1;

const LEN_BYTES: usize = 2;

/// Largest payload that fits the 16-bit section size.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - LEN_BYTES;

/// A length-prefixed blob kept in section `id`.
#[derive(Debug)]
pub struct VariablePersistentAllocation<'a> {
    storage: &'a PersistentStorage,
    id: u16,
    lock: Mutex<()>,
}

impl<'a> VariablePersistentAllocation<'a> {
    /// Binds a blob to section `id` of `storage`; nothing is read or allocated yet.
    pub fn new(storage: &'a PersistentStorage, id: u16) -> Self {
        Self {
            storage,
            id,
            lock: Mutex::new(()),
        }
    }

    /// Section id holding the blob.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns the stored payload, or an empty vector if nothing was stored.
    ///
    /// # Errors
    ///
    /// - [`StorageError::ForeignVersion`] if the section has another version.
    /// - [`StorageError::Corrupt`] if its length prefix overruns the section.
    pub fn get_data(&self) -> Result<Vec<u8>, StorageError> {
        let _guard = self.lock.lock();
        match self.storage.get_section_version(self.id) {
            0 => return Ok(Vec::new()),
            RECORD_VERSION => {}
            found => return Err(StorageError::ForeignVersion { id: self.id, found }),
        }

        let section = self
            .storage
            .get_section(self.id, RECORD_VERSION, LEN_BYTES as u16)
            .ok_or(StorageError::Corrupt(self.id))?;
        let bytes = section.bytes()?;
        let len = usize::from(LittleEndian::read_u16(&bytes[..LEN_BYTES]));
        let payload = bytes.get(LEN_BYTES..LEN_BYTES + len).map(<[u8]>::to_vec);
        payload.ok_or(StorageError::Corrupt(self.id))
    }

    /// Stores `data` and schedules it for write-back.
    ///
    /// The existing section is reused when it already spans exactly the pages
    /// the new blob needs; otherwise it is deleted and reallocated, so a
    /// shrinking blob gives pages back. `complete` is passed to the flush.
    ///
    /// # Errors
    ///
    /// - [`StorageError::TooLarge`] if `data` exceeds [`MAX_PAYLOAD`].
    /// - [`StorageError::ForeignVersion`] if the section has another version.
    /// - [`StorageError::AllocationFailed`] if no space is left.
    /// - Any error from scheduling the flush.
    pub fn set_data(&self, data: &[u8], complete: Option<Completion>) -> Result<(), StorageError> {
        if data.len() > MAX_PAYLOAD {
            return Err(StorageError::TooLarge(data.len()));
        }
        let _guard = self.lock.lock();

        let len = u16::try_from(data.len()).map_err(|_| StorageError::TooLarge(data.len()))?;
        let total = LEN_BYTES + data.len();
        let size = len + LEN_BYTES as u16;
        let wanted_pages = self.storage.geometry().pages_for(total);

        let existing = match self.storage.get_section_version(self.id) {
            0 => None,
            RECORD_VERSION => self
                .storage
                .get_section(self.id, RECORD_VERSION, LEN_BYTES as u16)
                .filter(|s| usize::from(s.record().page_count) == wanted_pages),
            found => return Err(StorageError::ForeignVersion { id: self.id, found }),
        };

        let section = match existing {
            Some(section) => section,
            None => {
                if self.storage.delete_section(self.id) {
                    debug!(target: "pstore::variable", id = self.id, wanted_pages, "reallocating blob section");
                }
                self.storage
                    .get_section(self.id, RECORD_VERSION, size)
                    .ok_or_else(|| {
                        warn!(target: "pstore::variable", id = self.id, len = data.len(), "unable to store blob");
                        StorageError::AllocationFailed(self.id)
                    })?
            }
        };

        let mut encoded = vec![0u8; total];
        LittleEndian::write_u16(&mut encoded[..LEN_BYTES], len);
        encoded[LEN_BYTES..].copy_from_slice(data);
        section.write_from(0, &encoded)?;
        section.flush_part(0, total, complete)
    }
}
