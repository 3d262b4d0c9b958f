//! Header and record codec over a borrowed device image.
//!
//! ```text
//! offset 0            [version: u16 LE]
//! offset 2 + 8*n      [id: u16][page_offset: u16][page_count: u16][version: u16]
//! ```
//!
//! Readers stop at the first record whose id is [`END_OF_INDEX`], or at the
//! end of the image if a corrupt index has lost its terminator.

use byteorder::{ByteOrder, LittleEndian};

use crate::{IndexError, IndexRecord, END_OF_INDEX, FORMAT_VERSION, HEADER_BYTES, RECORD_BYTES};

/// Byte offset of index slot `slot`.
fn slot_offset(slot: usize) -> usize {
    HEADER_BYTES + slot * RECORD_BYTES
}

/// Reads the header version.
#[must_use]
pub fn header_version(image: &[u8]) -> u16 {
    LittleEndian::read_u16(&image[..HEADER_BYTES])
}

/// Overwrites the header version.
pub fn set_header_version(image: &mut [u8], version: u16) {
    LittleEndian::write_u16(&mut image[..HEADER_BYTES], version);
}

/// Writes a fresh header and an empty index.
///
/// Section payload bytes are left as they are; without index records they are
/// unreachable.
pub fn format_image(image: &mut [u8]) {
    set_header_version(image, FORMAT_VERSION);
    write_terminator(image, 0);
}

/// Decodes the record in `slot`, or `None` if the slot lies past the image.
#[must_use]
pub fn read_record(image: &[u8], slot: usize) -> Option<IndexRecord> {
    let off = slot_offset(slot);
    let raw = image.get(off..off + RECORD_BYTES)?;
    Some(IndexRecord {
        id: LittleEndian::read_u16(&raw[0..2]),
        page_offset: LittleEndian::read_u16(&raw[2..4]),
        page_count: LittleEndian::read_u16(&raw[4..6]),
        version: LittleEndian::read_u16(&raw[6..8]),
    })
}

/// Encodes `rec` into `slot`.
pub fn write_record(image: &mut [u8], slot: usize, rec: &IndexRecord) -> Result<(), IndexError> {
    let off = slot_offset(slot);
    let raw = image
        .get_mut(off..off + RECORD_BYTES)
        .ok_or(IndexError::NoRoom { slot })?;
    LittleEndian::write_u16(&mut raw[0..2], rec.id);
    LittleEndian::write_u16(&mut raw[2..4], rec.page_offset);
    LittleEndian::write_u16(&mut raw[4..6], rec.page_count);
    LittleEndian::write_u16(&mut raw[6..8], rec.version);
    Ok(())
}

/// Writes only the terminator id into `slot`, leaving the rest of the record.
fn write_terminator(image: &mut [u8], slot: usize) -> bool {
    let off = slot_offset(slot);
    match image.get_mut(off..off + 2) {
        Some(raw) => {
            LittleEndian::write_u16(raw, END_OF_INDEX);
            true
        }
        None => false,
    }
}

/// Number of records before the terminator.
#[must_use]
pub fn record_count(image: &[u8]) -> usize {
    let mut n = 0;
    while let Some(rec) = read_record(image, n) {
        if rec.id == END_OF_INDEX {
            break;
        }
        n += 1;
    }
    n
}

/// Snapshot of every record, in index order.
#[must_use]
pub fn records(image: &[u8]) -> Vec<IndexRecord> {
    (0..record_count(image))
        .filter_map(|slot| read_record(image, slot))
        .collect()
}

/// Bytes occupied by the header and index, terminator included.
#[must_use]
pub fn index_len(image: &[u8]) -> usize {
    slot_offset(record_count(image) + 1).min(image.len())
}

/// Finds the first record for `id`, returning its slot.
#[must_use]
pub fn find(image: &[u8], id: u16) -> Option<(usize, IndexRecord)> {
    if id == END_OF_INDEX {
        return None;
    }
    (0..record_count(image))
        .filter_map(|slot| read_record(image, slot).map(|r| (slot, r)))
        .find(|(_, r)| r.id == id)
}

/// Appends `rec` after the last record and moves the terminator behind it.
///
/// Returns the slot the record was written to. Nothing is modified on error.
pub fn append(image: &mut [u8], rec: &IndexRecord) -> Result<usize, IndexError> {
    if rec.id == END_OF_INDEX {
        return Err(IndexError::ReservedId(rec.id));
    }
    let slot = record_count(image);
    if slot_offset(slot + 1) + RECORD_BYTES > image.len() {
        return Err(IndexError::NoRoom { slot: slot + 1 });
    }
    write_terminator(image, slot + 1);
    write_record(image, slot, rec)?;
    Ok(slot)
}

/// Removes every record for `id`, compacting the array in place.
///
/// Returns the removed records (normally zero or one, but duplicates from a
/// damaged index are all dropped).
pub fn remove(image: &mut [u8], id: u16) -> Vec<IndexRecord> {
    let all = records(image);
    let (removed, kept): (Vec<_>, Vec<_>) = all.into_iter().partition(|r| r.id == id);
    if removed.is_empty() {
        return removed;
    }
    for (slot, rec) in kept.iter().enumerate() {
        // kept.len() < original count, so every slot already existed
        let _ = write_record(image, slot, rec);
    }
    write_terminator(image, kept.len());
    removed
}

/// Sets the version of every record for `id`, returning how many changed.
pub fn set_version(image: &mut [u8], id: u16, version: u16) -> usize {
    let mut updated = 0;
    for slot in 0..record_count(image) {
        if let Some(mut rec) = read_record(image, slot) {
            if rec.id == id {
                rec.version = version;
                let _ = write_record(image, slot, &rec);
                updated += 1;
            }
        }
    }
    updated
}
