//! # Index - Section Table Layout and Allocator
//!
//! The first bytes of the device image hold a small header followed by the
//! section index: a packed array of fixed-size records terminated by a record
//! whose id is [`END_OF_INDEX`]. Section payloads are placed in whole pages,
//! allocated backward from the end of the device so the index can grow
//! forward into the free space between them.
//!
//! ## Image layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ HEADER (2 bytes)                                             │
//! │   version (u16 LE)      0x0000 / 0xFFFF = uninitialized      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ INDEX (8 bytes per record)                                   │
//! │   id (u16) | page_offset (u16) | page_count (u16) | version  │
//! │   ... repeated ...                                           │
//! │   id = 0x0000 terminator                                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ free pages (index grows down into here)                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ section payloads, newest lowest, first allocation at the end │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Page offsets and counts are 16-bit, which
//! caps a device at 65535 pages; [`Geometry::new`] enforces it.
//!
//! The functions in [`format`] operate on a borrowed image and perform no
//! locking or I/O; [`alloc::plan_allocation`] is a pure function of the
//! current records.

pub mod alloc;
pub mod format;

pub use alloc::{minimum_page, plan_allocation};
pub use format::{
    append, find, format_image, header_version, index_len, read_record, record_count, records,
    remove, set_header_version, set_version, write_record,
};

use thiserror::Error;

/// Size of the image header in bytes.
pub const HEADER_BYTES: usize = 2;

/// Size of one index record in bytes.
pub const RECORD_BYTES: usize = 8;

/// Reserved section id marking the end of the index. Never a valid section.
pub const END_OF_INDEX: u16 = 0x0000;

/// Header version written by [`format_image`].
pub const FORMAT_VERSION: u16 = 1;

/// Largest page count addressable by the 16-bit record fields.
pub const MAX_PAGES: usize = u16::MAX as usize;

/// State of an image as reported by its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Blank or erased device, or one explicitly deinitialized.
    Uninitialized,
    /// The header carries [`FORMAT_VERSION`].
    Valid,
    /// Some other format version.
    Unrecognized(u16),
}

impl HeaderState {
    /// Classifies a raw header version.
    #[must_use]
    pub fn classify(version: u16) -> Self {
        match version {
            0x0000 | 0xFFFF => HeaderState::Uninitialized,
            FORMAT_VERSION => HeaderState::Valid,
            other => HeaderState::Unrecognized(other),
        }
    }
}

/// One entry of the section index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRecord {
    /// Section id.
    pub id: u16,
    /// First page of the section.
    pub page_offset: u16,
    /// Length of the section in pages.
    pub page_count: u16,
    /// Caller-assigned compatibility version.
    pub version: u16,
}

impl IndexRecord {
    /// One past the last page of the section.
    #[must_use]
    pub fn end_page(&self) -> usize {
        self.page_offset as usize + self.page_count as usize
    }

    /// Whether this section shares at least one page with `[page_offset, page_offset + page_count)`.
    #[must_use]
    pub fn overlaps(&self, page_offset: usize, page_count: usize) -> bool {
        let start = self.page_offset as usize;
        if page_offset >= self.end_page() {
            return false;
        }
        if start >= page_offset + page_count {
            return false;
        }
        true
    }

    /// Byte address of the section payload.
    #[must_use]
    pub fn byte_offset(&self, page_size: usize) -> usize {
        self.page_offset as usize * page_size
    }

    /// Byte capacity of the section payload.
    #[must_use]
    pub fn byte_len(&self, page_size: usize) -> usize {
        self.page_count as usize * page_size
    }
}

/// Reasons a device cannot carry a section index.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// The device reports a zero page size.
    #[error("page size must be non-zero")]
    ZeroPageSize,

    /// The device size is not a whole number of pages.
    #[error("device size {total_size} is not a multiple of page size {page_size}")]
    Unaligned {
        /// Device size in bytes.
        total_size: usize,
        /// Page size in bytes.
        page_size: usize,
    },

    /// Page offsets would not fit the 16-bit record fields.
    #[error("device has {pages} pages, at most {MAX_PAGES} are addressable")]
    TooManyPages {
        /// Page count of the device.
        pages: usize,
    },

    /// Not even the header and an empty index fit.
    #[error("device size {total_size} cannot hold the header and index terminator")]
    TooSmall {
        /// Device size in bytes.
        total_size: usize,
    },
}

/// Errors from mutating an index image.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// The record (or the terminator after it) would run past the image.
    #[error("index slot {slot} does not fit in the image")]
    NoRoom {
        /// Slot that was being written.
        slot: usize,
    },

    /// The terminator id cannot be stored as a section.
    #[error("section id 0x{0:04x} is reserved")]
    ReservedId(u16),
}

/// Page geometry of a device, validated for use with the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    total_size: usize,
    page_size: usize,
}

impl Geometry {
    /// Validates a device of `total_size` bytes with `page_size`-byte pages.
    pub fn new(total_size: usize, page_size: usize) -> Result<Self, GeometryError> {
        if page_size == 0 {
            return Err(GeometryError::ZeroPageSize);
        }
        if total_size % page_size != 0 {
            return Err(GeometryError::Unaligned {
                total_size,
                page_size,
            });
        }
        let pages = total_size / page_size;
        if pages > MAX_PAGES {
            return Err(GeometryError::TooManyPages { pages });
        }
        if total_size < HEADER_BYTES + RECORD_BYTES {
            return Err(GeometryError::TooSmall { total_size });
        }
        Ok(Self {
            total_size,
            page_size,
        })
    }

    /// Device size in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages on the device.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_size / self.page_size
    }

    /// Pages needed to hold `size` bytes. A section always spans at least one page.
    #[must_use]
    pub fn pages_for(&self, size: usize) -> usize {
        size.div_ceil(self.page_size).max(1)
    }

    /// Rounds `addr` down to the start of its page.
    #[must_use]
    pub fn page_floor(&self, addr: usize) -> usize {
        addr - addr % self.page_size
    }

    /// Rounds `addr` up to a page boundary, capped at the device size.
    #[must_use]
    pub fn page_ceil(&self, addr: usize) -> usize {
        addr.div_ceil(self.page_size)
            .saturating_mul(self.page_size)
            .min(self.total_size)
    }
}
