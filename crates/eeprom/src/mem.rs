//! RAM-backed device with write accounting.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::{check_range, Eeprom, EepromError, ERASED_BYTE};

/// An [`Eeprom`] held entirely in memory.
///
/// Besides storing bytes it records every write it receives, so tests can
/// assert on write amplification and ordering, and it can be told to fail
/// specific writes to exercise the retry path.
#[derive(Debug)]
pub struct MemEeprom {
    page_size: usize,
    state: Mutex<MemState>,
}

#[derive(Debug)]
struct MemState {
    bytes: Vec<u8>,
    /// Offsets of successful writes, in arrival order.
    write_log: Vec<usize>,
    /// Number of writes (successful or not) received.
    write_attempts: usize,
    /// Remaining injected failures, keyed by write offset.
    failures: HashMap<usize, usize>,
}

impl MemEeprom {
    /// Creates an erased device of `total_size` bytes.
    #[must_use]
    pub fn new(total_size: usize, page_size: usize) -> Self {
        Self::from_image(vec![ERASED_BYTE; total_size], page_size)
    }

    /// Creates a device pre-loaded with `image`.
    #[must_use]
    pub fn from_image(image: Vec<u8>, page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(MemState {
                bytes: image,
                write_log: Vec::new(),
                write_attempts: 0,
                failures: HashMap::new(),
            }),
        }
    }

    /// Makes the next `times` writes starting at `offset` come back short.
    ///
    /// The device content is left untouched by a failed write.
    pub fn fail_writes_at(&self, offset: usize, times: usize) {
        let mut st = self.state.lock();
        if times == 0 {
            st.failures.remove(&offset);
        } else {
            st.failures.insert(offset, times);
        }
    }

    /// Returns a copy of the current device content.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.lock().write_log.len()
    }

    /// Number of writes attempted so far, including injected failures.
    #[must_use]
    pub fn write_attempts(&self) -> usize {
        self.state.lock().write_attempts
    }

    /// Offsets of successful writes, oldest first.
    #[must_use]
    pub fn write_log(&self) -> Vec<usize> {
        self.state.lock().write_log.clone()
    }

    /// Forgets the write history (content is kept).
    pub fn clear_write_log(&self) {
        let mut st = self.state.lock();
        st.write_log.clear();
        st.write_attempts = 0;
    }

    /// Overwrites device content directly, bypassing accounting.
    ///
    /// Used to prepare images such as a foreign header version.
    pub fn poke(&self, offset: usize, data: &[u8]) -> Result<(), EepromError> {
        let mut st = self.state.lock();
        check_range(offset, data.len(), st.bytes.len())?;
        st.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Eeprom for MemEeprom {
    fn total_size(&self) -> usize {
        self.state.lock().bytes.len()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, EepromError> {
        let st = self.state.lock();
        check_range(offset, buf.len(), st.bytes.len())?;
        buf.copy_from_slice(&st.bytes[offset..offset + buf.len()]);
        Ok(buf.len())
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, EepromError> {
        let mut st = self.state.lock();
        check_range(offset, buf.len(), st.bytes.len())?;
        st.write_attempts += 1;

        if let Some(remaining) = st.failures.get_mut(&offset) {
            *remaining -= 1;
            if *remaining == 0 {
                st.failures.remove(&offset);
            }
            trace!(target: "pstore::eeprom", offset, len = buf.len(), "injected write failure");
            return Ok(0);
        }

        st.bytes[offset..offset + buf.len()].copy_from_slice(buf);
        st.write_log.push(offset);
        Ok(buf.len())
    }
}
