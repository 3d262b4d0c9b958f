//! Backward first-fit page allocator.
//!
//! New sections are placed as close to the end of the device as possible.
//! The scan starts with the section flush against the last page; whenever the
//! candidate range overlaps existing sections it drops to just below the
//! lowest conflicting one and tries again. It gives up once the candidate
//! would reach into the pages the index itself needs after this allocation
//! (header, every existing record, the new record, and the terminator).
//! The same bound applies to sections already placed: if the grown index
//! would spill into the lowest existing section, nothing is allocated.
//!
//! Given the same sequence of allocations and deletions the resulting layout
//! is always the same.

use crate::{Geometry, IndexRecord, HEADER_BYTES, RECORD_BYTES};

/// First page a section may occupy while the index holds `record_count`
/// records and is about to gain one more.
#[must_use]
pub fn minimum_page(record_count: usize, geometry: &Geometry) -> usize {
    let minimum_address = HEADER_BYTES + (record_count + 2) * RECORD_BYTES;
    minimum_address.div_ceil(geometry.page_size())
}

/// Chooses the first page for a new section of `needed_pages` pages.
///
/// Returns `None` when no free run of pages exists above the reserved index
/// area.
#[must_use]
pub fn plan_allocation(
    records: &[IndexRecord],
    geometry: &Geometry,
    needed_pages: usize,
) -> Option<u16> {
    let total_pages = geometry.total_pages();
    if needed_pages == 0 || needed_pages > total_pages {
        return None;
    }
    let minimum = minimum_page(records.len(), geometry);
    // the grown index must not reach into a section placed while it was smaller
    let lowest_section = records.iter().map(|r| r.page_offset as usize).min();
    if lowest_section.is_some_and(|lowest| minimum > lowest) {
        return None;
    }

    let mut candidate = total_pages - needed_pages;
    loop {
        if candidate < minimum {
            return None;
        }
        let lowest_conflict = records
            .iter()
            .filter(|r| r.overlaps(candidate, needed_pages))
            .map(|r| r.page_offset as usize)
            .min();
        match lowest_conflict {
            None => return u16::try_from(candidate).ok(),
            // conflict start < candidate + needed_pages, so this always moves down
            Some(start) => candidate = start.checked_sub(needed_pages)?,
        }
    }
}
