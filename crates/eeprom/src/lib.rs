//! # EEPROM - Page-Addressed Device Abstraction
//!
//! The persistent storage service sits on top of a single byte-addressable,
//! page-oriented non-volatile device. This crate defines the contract it
//! consumes ([`Eeprom`]) and two implementations:
//!
//! - [`MemEeprom`]: RAM-backed, with write accounting and fault injection for
//!   tests and benchmarks.
//! - [`FileEeprom`]: a regular file standing in for the device, optionally
//!   `fsync`ed after every page write.
//!
//! ## Contract
//!
//! ```text
//! total_size()                       bytes on the device
//! page_size()                        smallest unit of atomic write
//! read(offset, buf)  -> bytes read
//! write(offset, buf) -> bytes written   (short count == failed write)
//! ```
//!
//! Calls are synchronous and blocking. Implementations are shared between the
//! caller threads and the background flush worker, hence `Send + Sync` and
//! `&self` receivers.
//!
//! ## Example
//!
//! ```rust
//! use eeprom::{Eeprom, MemEeprom};
//!
//! let dev = MemEeprom::new(1024, 64);
//! assert_eq!(dev.write(64, &[1, 2, 3]).unwrap(), 3);
//! let mut buf = [0u8; 3];
//! dev.read(64, &mut buf).unwrap();
//! assert_eq!(buf, [1, 2, 3]);
//! ```

mod file;
mod mem;

pub use file::FileEeprom;
pub use mem::MemEeprom;

use std::io;

use thiserror::Error;

/// Value of every byte on a freshly erased device.
pub const ERASED_BYTE: u8 = 0xFF;

/// Errors reported by an [`Eeprom`] implementation.
#[derive(Debug, Error)]
pub enum EepromError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The access does not fit inside the device.
    #[error("access of {len} bytes at offset {offset} exceeds device size {size}")]
    OutOfRange {
        /// First byte of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Total device size.
        size: usize,
    },
}

/// A synchronous, page-addressed non-volatile device.
pub trait Eeprom: Send + Sync {
    /// Total addressable size in bytes.
    fn total_size(&self) -> usize;

    /// Page size in bytes. Writes of one aligned page are atomic.
    fn page_size(&self) -> usize;

    /// Reads `buf.len()` bytes starting at `offset`, returning the count read.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, EepromError>;

    /// Writes `buf` at `offset`, returning the count actually written.
    ///
    /// A count lower than `buf.len()` means the write failed part-way and the
    /// affected page content is undefined.
    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, EepromError>;
}

/// Rejects accesses that run past the end of a device of `size` bytes.
pub(crate) fn check_range(offset: usize, len: usize, size: usize) -> Result<(), EepromError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(EepromError::OutOfRange { offset, len, size }),
    }
}
