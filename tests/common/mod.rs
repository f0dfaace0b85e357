//! Shared helpers for integration tests: hand-built hives with exact cell
//! layouts.
#![allow(dead_code)]

use reg_engine::codec::{write_i32_le, write_u32_le};
use reg_engine::container::Container;
use reg_engine::hbin::HBIN_HEADER_SIZE;
use reg_engine::header::{self, BASE_BLOCK_SIZE, REGF_SIGNATURE};
use std::path::Path;

/// Usable cell bytes in a single-page hbin.
pub const USABLE: usize = 0x1000 - HBIN_HEADER_SIZE;

/// Builds a hive with one 4KB hbin whose cells have exactly the given raw
/// signed sizes (positive = free, negative = allocated). The sizes must sum
/// to 4064 in magnitude.
pub fn build_hive(path: &Path, raw_sizes: &[i32]) -> Container {
    let total: usize = raw_sizes.iter().map(|s| s.unsigned_abs() as usize).sum();
    assert_eq!(total, USABLE, "cells must exactly fill the hbin");

    let mut buf = vec![0u8; BASE_BLOCK_SIZE + 0x1000];

    buf[0..4].copy_from_slice(REGF_SIGNATURE);
    header::set_primary_sequence(&mut buf, 1).unwrap();
    header::set_secondary_sequence(&mut buf, 1).unwrap();
    header::set_timestamp(&mut buf, header::filetime_now()).unwrap();
    write_u32_le(&mut buf, 0x14, 1).unwrap(); // major
    write_u32_le(&mut buf, 0x18, 3).unwrap(); // minor
    write_u32_le(&mut buf, 0x1C, 0).unwrap(); // type
    write_u32_le(&mut buf, 0x20, 1).unwrap(); // format
    write_u32_le(&mut buf, header::ROOT_CELL_OFFSET, 0x20).unwrap();
    header::set_data_size(&mut buf, 0x1000).unwrap();
    write_u32_le(&mut buf, 0x2C, 1).unwrap(); // clustering factor

    // hbin header
    buf[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + 4].copy_from_slice(b"hbin");
    write_u32_le(&mut buf, BASE_BLOCK_SIZE + 0x04, 0).unwrap();
    write_u32_le(&mut buf, BASE_BLOCK_SIZE + 0x08, 0x1000).unwrap();

    let mut cursor = BASE_BLOCK_SIZE + HBIN_HEADER_SIZE;
    for &raw in raw_sizes {
        write_i32_le(&mut buf, cursor, raw).unwrap();
        cursor += raw.unsigned_abs() as usize;
    }

    header::write_checksum(&mut buf).unwrap();
    std::fs::write(path, &buf).unwrap();
    Container::open(path).unwrap()
}

/// Asserts the core structural invariants over every hbin: accounting,
/// alignment, contiguity, and sign encoding.
pub fn assert_structural_invariants(container: &Container) {
    for hbin in container.hbins() {
        let (hbin_abs, hbin_size) = hbin.unwrap();
        assert_eq!(hbin_abs % 0x1000, 0, "hbin offset aligned");
        assert_eq!(hbin_size % 0x1000, 0, "hbin size aligned");

        let mut cursor = hbin_abs + HBIN_HEADER_SIZE;
        let mut total = 0usize;
        for cell in container.cells(hbin_abs, hbin_size) {
            let cell = cell.unwrap();
            assert_eq!(cell.offset, cursor, "cells are contiguous");
            assert_eq!(cell.offset % 8, 0, "cell offset aligned");
            assert_eq!(cell.size() % 8, 0, "cell size aligned");
            assert!(cell.size() >= 8, "cell at least 8 bytes");
            assert_ne!(cell.raw_size, 0, "no zero-size cells");
            cursor += cell.size();
            total += cell.size();
        }
        assert_eq!(
            total,
            hbin_size - HBIN_HEADER_SIZE,
            "cells exactly fill hbin at {hbin_abs:#x}"
        );
    }

    // File size matches the header data size
    assert_eq!(
        container.len(),
        BASE_BLOCK_SIZE + container.data_size().unwrap() as usize
    );
}
