//! Shadow mirror of the device.
//!
//! Holds the bytes last known to be on the device plus a CRC32 of every page.
//! The checksums are only ever recomputed from bytes this module wrote itself,
//! so a page whose bytes no longer match its checksum has been corrupted from
//! outside.

use std::ops::Range;

use index::Geometry;

/// Device-side half of the cache pair.
#[derive(Debug)]
pub(crate) struct Shadow {
    bytes: Vec<u8>,
    crcs: Vec<u32>,
    page_size: usize,
}

impl Shadow {
    pub(crate) fn new(geometry: Geometry) -> Self {
        let mut shadow = Self {
            bytes: vec![0u8; geometry.total_size()],
            crcs: vec![0u32; geometry.total_pages()],
            page_size: geometry.page_size(),
        };
        shadow.rehash_all();
        shadow
    }

    /// Replaces the whole mirror with `image`, as read from the device.
    pub(crate) fn load(&mut self, image: &[u8]) {
        self.bytes.copy_from_slice(image);
        self.rehash_all();
    }

    fn rehash_all(&mut self) {
        for (crc, page) in self.crcs.iter_mut().zip(self.bytes.chunks(self.page_size)) {
            *crc = crc32fast::hash(page);
        }
    }

    fn page_range(&self, page: usize) -> Range<usize> {
        let start = page * self.page_size;
        start..start + self.page_size
    }

    /// Bytes of page `page`.
    pub(crate) fn page(&self, page: usize) -> &[u8] {
        &self.bytes[self.page_range(page)]
    }

    /// Checks the checksum of every page in `pages`, returning the first bad one.
    pub(crate) fn verify(&self, pages: Range<usize>) -> Result<(), usize> {
        for page in pages {
            if crc32fast::hash(self.page(page)) != self.crcs[page] {
                return Err(page);
            }
        }
        Ok(())
    }

    /// Records that `data` is now the content of `page` on the device.
    pub(crate) fn commit(&mut self, page: usize, data: &[u8]) {
        let range = self.page_range(page);
        self.bytes[range].copy_from_slice(data);
        self.crcs[page] = crc32fast::hash(data);
    }

    /// Flips a byte without updating its checksum.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, offset: usize) {
        self.bytes[offset] ^= 0xA5;
    }
}
