use super::helpers::*;
use crate::*;
use anyhow::Result;

// --------------------- Lookup & Allocation ---------------------

#[test]
fn repeated_get_returns_same_section() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;

    let first = storage.get_section(0x20, 1, 100).expect("allocate");
    let second = storage.get_section(0x20, 1, 100).expect("lookup");

    assert_eq!(first.offset(), second.offset());
    assert_eq!(first.record(), second.record());
    let matching = storage
        .list_sections()
        .iter()
        .filter(|r| r.id == 0x20)
        .count();
    assert_eq!(matching, 1);
    Ok(())
}

#[test]
fn version_and_size_mismatch_are_refused() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 16)?;

    let section = storage.get_section(0x10, 1, 40).expect("allocate");
    assert_eq!(section.record().page_count, 3);

    assert!(storage.get_section(0x10, 2, 40).is_none());
    assert_eq!(storage.get_section_version(0x10), 1);

    assert!(storage.get_section(0x10, 1, 100).is_none(), "needs 7 pages, has 3");

    // anything that fits the existing pages is a plain lookup
    assert!(storage.get_section(0x10, 1, 48).is_some());
    assert!(storage.get_section(0x10, 1, 1).is_some());
    assert_eq!(storage.list_sections().len(), 1);
    Ok(())
}

#[test]
fn allocation_packs_backward_from_the_end() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;

    let one = storage.get_section(1, 1, 50).expect("section 1");
    let two = storage.get_section(2, 1, 50).expect("section 2");

    assert_eq!(one.record().page_offset, 15);
    assert_eq!(two.record().page_offset, 14);
    assert_eq!(one.offset(), 960);
    assert_eq!(two.offset(), 896);
    assert_eq!(one.len(), 64);
    Ok(())
}

#[test]
fn exhausted_capacity_leaves_index_untouched() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;

    let big = storage.get_section(1, 1, 640).expect("ten pages");
    assert_eq!(big.record().page_offset, 6);

    // pages 1..6 are free: five pages, six requested
    let before = storage.list_sections();
    assert!(storage.get_section(2, 1, 6 * 64).is_none());
    assert_eq!(storage.list_sections(), before);

    let fits = storage.get_section(2, 1, 5 * 64).expect("five pages fit");
    assert_eq!(fits.record().page_offset, 1);
    Ok(())
}

#[test]
fn reserved_id_and_version_are_refused() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    assert!(storage.get_section(index::END_OF_INDEX, 1, 10).is_none());
    assert!(storage.get_section(0x30, 0, 10).is_none());
    assert!(storage.list_sections().is_empty());
    Ok(())
}

#[test]
fn zero_size_section_gets_one_page() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    let section = storage.get_section(0x31, 1, 0).expect("allocate");
    assert_eq!(section.len(), 64);
    assert!(!section.is_empty());
    Ok(())
}

// --------------------- Versions & Deletion ---------------------

#[test]
fn absent_section_has_version_zero() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    assert_eq!(storage.get_section_version(0x40), 0);
    storage.set_section_version(0x40, 9);
    assert_eq!(storage.get_section_version(0x40), 0);
    assert!(storage.list_sections().is_empty());
    Ok(())
}

#[test]
fn set_section_version_updates_and_persists() -> Result<()> {
    let (dev, storage) = open_mem(1024, 64)?;
    storage.get_section(0x41, 1, 8).expect("allocate");

    storage.set_section_version(0x41, 3);
    assert_eq!(storage.get_section_version(0x41), 3);
    assert!(storage.get_section(0x41, 1, 8).is_none());
    assert!(storage.get_section(0x41, 3, 8).is_some());

    storage.sync()?;
    let image = dev.snapshot();
    assert_eq!(index::read_record(&image, 0).map(|r| r.version), Some(3));
    Ok(())
}

#[test]
fn deleted_pages_are_reused() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    storage.get_section(1, 1, 50).expect("section 1");
    storage.get_section(2, 1, 50).expect("section 2");

    assert!(storage.delete_section(1));
    assert!(!storage.delete_section(1));
    assert_eq!(storage.get_section_version(1), 0);

    let three = storage.get_section(3, 1, 50).expect("section 3");
    assert_eq!(three.record().page_offset, 15);
    let ids: Vec<u16> = storage.list_sections().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3]);
    Ok(())
}

#[test]
fn reallocated_id_starts_from_requested_version() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    storage.get_section(5, 1, 10).expect("v1");
    assert!(storage.delete_section(5));
    let again = storage.get_section(5, 2, 10).expect("v2");
    assert_eq!(again.version(), 2);
    assert_eq!(storage.get_section_version(5), 2);
    Ok(())
}

#[test]
fn growing_index_never_overwrites_low_section() -> Result<()> {
    let (dev, storage) = open_mem(128, 16)?;
    let x = storage.get_section(0x10, 1, 80).expect("x");
    let y = storage.get_section(0x11, 1, 16).expect("y");
    assert_eq!(x.record().page_offset, 3);
    assert_eq!(y.record().page_offset, 2);
    y.write_from(0, b"YYYYYYYY")?;
    assert!(storage.delete_section(0x10));

    let a = storage.get_section(0x12, 1, 1).expect("a");
    assert_eq!(a.record().page_offset, 7);
    // a third record would push the index onto page 2
    assert!(storage.get_section(0x13, 1, 1).is_none());
    assert!(storage.get_section(0x14, 1, 1).is_none());

    let mut buf = [0u8; 8];
    y.read_into(0, &mut buf)?;
    assert_eq!(&buf, b"YYYYYYYY");
    let ids: Vec<u16> = storage.list_sections().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![0x11, 0x12]);

    storage.sync()?;
    let reopened = PersistentStorage::new(dev.clone(), quiet_config())?;
    let y = reopened.get_section(0x11, 1, 16).expect("y survives");
    y.read_into(0, &mut buf)?;
    assert_eq!(&buf, b"YYYYYYYY");
    Ok(())
}

// --------------------- Handles ---------------------

#[test]
fn handle_reads_and_writes() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    let section = storage.get_section(0x50, 1, 100).expect("allocate");

    section.write_from(10, b"hello")?;
    let mut buf = [0u8; 5];
    section.read_into(10, &mut buf)?;
    assert_eq!(&buf, b"hello");

    {
        let mut bytes = section.bytes_mut()?;
        bytes[0] = 0xAA;
    }
    assert_eq!(section.bytes()?[0], 0xAA);
    assert_eq!(section.to_vec()?.len(), 128);
    Ok(())
}

#[test]
fn handle_accesses_are_bounds_checked() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    let section = storage.get_section(0x51, 1, 10).expect("allocate");

    let err = section.write_from(60, &[0u8; 8]).unwrap_err();
    assert!(matches!(
        err,
        StorageError::SectionBounds {
            at: 60,
            len: 8,
            capacity: 64
        }
    ));
    let mut buf = [0u8; 2];
    assert!(section.read_into(usize::MAX, &mut buf).is_err());
    assert!(section.flush_part(63, 2, None).is_err());
    Ok(())
}

#[test]
fn handle_to_deleted_section_does_not_alias_its_successor() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    let a = storage.get_section(0x21, 1, 10).expect("a");
    assert!(a.is_live());
    assert!(storage.delete_section(0x21));
    let b = storage.get_section(0x22, 1, 10).expect("b");
    assert_eq!(a.offset(), b.offset(), "b reuses the freed page");
    b.write_from(0, b"bbbb")?;

    assert!(!a.is_live());
    assert!(matches!(
        a.write_from(0, b"AAAA"),
        Err(StorageError::StaleSection(0x21))
    ));
    let mut buf = [0u8; 4];
    assert!(matches!(
        a.read_into(0, &mut buf),
        Err(StorageError::StaleSection(0x21))
    ));
    assert!(a.bytes().is_err());
    assert!(a.bytes_mut().is_err());
    assert!(a.to_vec().is_err());
    assert!(a.flush(None).is_err());
    assert!(a.sync().is_err());

    b.read_into(0, &mut buf)?;
    assert_eq!(&buf, b"bbbb");
    Ok(())
}

#[test]
fn handle_survives_version_change_but_not_reallocation() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    let first = storage.get_section(0x23, 1, 10).expect("v1");
    storage.set_section_version(0x23, 2);
    assert!(first.is_live());
    first.write_from(0, b"still")?;

    assert!(storage.delete_section(0x23));
    storage.get_section(0x24, 1, 10).expect("filler");
    let second = storage.get_section(0x23, 1, 10).expect("again");
    assert_ne!(first.offset(), second.offset());
    assert!(matches!(
        first.write_from(0, b"gone"),
        Err(StorageError::StaleSection(0x23))
    ));
    second.write_from(0, b"fresh")?;
    Ok(())
}

#[test]
fn flush_range_outside_device_is_rejected() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    assert!(matches!(
        storage.flush_range(1000, 100, None),
        Err(StorageError::RangeOutOfBounds {
            start: 1000,
            len: 100,
            size: 1024
        })
    ));
    assert!(storage.flush_range(usize::MAX, 2, None).is_err());
    assert!(storage.flush_range(0, 1024, None).is_ok());
    Ok(())
}

#[test]
fn section_sync_makes_payload_durable() -> Result<()> {
    let (dev, storage) = open_mem(1024, 64)?;
    let section = storage.get_section(0x52, 1, 20).expect("allocate");
    section.write_from(0, b"durable")?;
    section.sync()?;

    let image = dev.snapshot();
    let at = section.offset();
    assert_eq!(&image[at..at + 7], b"durable");
    Ok(())
}

#[test]
fn index_is_written_to_device() -> Result<()> {
    let (dev, storage) = open_mem(1024, 64)?;
    storage.get_section(0x0101, 4, 50).expect("allocate");
    storage.sync()?;

    let image = dev.snapshot();
    assert_eq!(index::header_version(&image), index::FORMAT_VERSION);
    assert_eq!(
        index::records(&image),
        vec![IndexRecord {
            id: 0x0101,
            page_offset: 15,
            page_count: 1,
            version: 4
        }]
    );
    Ok(())
}

#[test]
fn debug_output_summarizes_state() -> Result<()> {
    let (_dev, storage) = open_mem(1024, 64)?;
    storage.get_section(1, 1, 1).expect("allocate");
    let text = format!("{storage:?}");
    assert!(text.contains("PersistentStorage"));
    assert!(text.contains("sections: 1"));
    Ok(())
}
