//! Cell primitives: reference type, allocation-hint classes, and the
//! minimal root key cell written into freshly created hives.
//!
//! The storage engine never interprets cell payloads; the [`CellClass`] tag
//! exists purely as an allocation hint (and for trace logging) so callers
//! can label what a cell will hold.

use crate::codec::{write_i32_le, write_u16_le, write_u32_le, write_u64_le};
use crate::error::{HiveError, Result};

/// A cell reference: a file offset relative to 0x1000 (HCELL_INDEX).
pub type CellRef = u32;

/// Minimum size of any cell, header included.
pub const MIN_CELL_SIZE: usize = 8;

/// Minimum payload an allocation may request.
pub const MIN_PAYLOAD: usize = 4;

/// Size of the cell size-field header.
pub const CELL_HEADER_SIZE: usize = 4;

/// Content kind a cell is being allocated for.
///
/// This enum is closed: the storage engine does not support custom cell
/// kinds, and the tag never influences placement beyond trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    /// Key node (nk).
    KeyNode,

    /// Value key (vk).
    ValueKey,

    /// Security descriptor (sk).
    Security,

    /// Index leaf (li) subkey list.
    IndexLeaf,

    /// Fast leaf (lf) subkey list.
    FastLeaf,

    /// Hash leaf (lh) subkey list.
    HashLeaf,

    /// Index root (ri) subkey list.
    IndexRoot,

    /// Big data (db) block.
    BigData,

    /// Raw data with no structure signature (value data, segment lists).
    RawData,
}

impl CellClass {
    /// Short label used in trace output.
    pub fn name(&self) -> &'static str {
        match self {
            CellClass::KeyNode => "nk",
            CellClass::ValueKey => "vk",
            CellClass::Security => "sk",
            CellClass::IndexLeaf => "li",
            CellClass::FastLeaf => "lf",
            CellClass::HashLeaf => "lh",
            CellClass::IndexRoot => "ri",
            CellClass::BigData => "db",
            CellClass::RawData => "raw",
        }
    }
}

/// Key node flags used for the root cell of a fresh hive.
mod nk_flags {
    /// Key is an entry point of the hive.
    pub const HIVE_ENTRY: u16 = 0x0004;
    /// Key cannot be deleted.
    pub const NO_DELETE: u16 = 0x0008;
    /// Key name is stored compressed (ASCII).
    pub const COMP_NAME: u16 = 0x0020;
}

/// Total size of the minimal root key cell (header + fixed nk body).
pub const ROOT_KEY_CELL_SIZE: usize = 0x50;

/// Writes a minimal allocated root key cell at `abs_offset`.
///
/// The cell is 0x50 bytes: the 4-byte size header followed by a 76-byte nk
/// body with an empty name, no subkeys, no values, and invalid (-1) list
/// references. This is the smallest key node a registry editor will accept
/// as a hive root.
///
/// # Arguments
///
/// * `data` - The full hive buffer.
/// * `abs_offset` - Absolute offset where the cell header goes.
/// * `timestamp` - Windows FILETIME stored as the key's last-written time.
pub fn write_root_key_cell(data: &mut [u8], abs_offset: usize, timestamp: u64) -> Result<()> {
    if abs_offset + ROOT_KEY_CELL_SIZE > data.len() {
        return Err(HiveError::TruncatedData {
            offset: abs_offset as u32,
            expected: ROOT_KEY_CELL_SIZE,
            actual: data.len().saturating_sub(abs_offset),
        });
    }

    write_i32_le(data, abs_offset, -(ROOT_KEY_CELL_SIZE as i32))?;

    let body = abs_offset + CELL_HEADER_SIZE;
    data[body..body + 2].copy_from_slice(b"nk");
    write_u16_le(
        data,
        body + 0x02,
        nk_flags::HIVE_ENTRY | nk_flags::NO_DELETE | nk_flags::COMP_NAME,
    )?;
    write_u64_le(data, body + 0x04, timestamp)?;
    write_u32_le(data, body + 0x0C, 0)?; // access bits
    write_u32_le(data, body + 0x10, 0xFFFF_FFFF)?; // parent
    write_u32_le(data, body + 0x14, 0)?; // subkey count
    write_u32_le(data, body + 0x18, 0)?; // volatile subkey count
    write_u32_le(data, body + 0x1C, 0xFFFF_FFFF)?; // subkey list
    write_u32_le(data, body + 0x20, 0xFFFF_FFFF)?; // volatile subkey list
    write_u32_le(data, body + 0x24, 0)?; // value count
    write_u32_le(data, body + 0x28, 0xFFFF_FFFF)?; // value list
    write_u32_le(data, body + 0x2C, 0xFFFF_FFFF)?; // security
    write_u32_le(data, body + 0x30, 0xFFFF_FFFF)?; // class name
    write_u32_le(data, body + 0x34, 0)?; // max subkey name length
    write_u32_le(data, body + 0x38, 0)?; // max class name length
    write_u32_le(data, body + 0x3C, 0)?; // max value name length
    write_u32_le(data, body + 0x40, 0)?; // max value data length
    write_u32_le(data, body + 0x44, 0)?; // work var
    write_u16_le(data, body + 0x48, 0)?; // name length (empty)
    write_u16_le(data, body + 0x4A, 0)?; // class name length

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_i32_le;

    #[test]
    fn test_class_names() {
        assert_eq!(CellClass::KeyNode.name(), "nk");
        assert_eq!(CellClass::ValueKey.name(), "vk");
        assert_eq!(CellClass::Security.name(), "sk");
        assert_eq!(CellClass::IndexLeaf.name(), "li");
        assert_eq!(CellClass::FastLeaf.name(), "lf");
        assert_eq!(CellClass::HashLeaf.name(), "lh");
        assert_eq!(CellClass::IndexRoot.name(), "ri");
        assert_eq!(CellClass::BigData.name(), "db");
        assert_eq!(CellClass::RawData.name(), "raw");
    }

    #[test]
    fn test_root_key_cell_layout() {
        let mut data = vec![0u8; 0x2000];
        write_root_key_cell(&mut data, 0x1020, 0x1234_5678_9ABC_DEF0).unwrap();

        // Allocated cell of 0x50 bytes
        assert_eq!(read_i32_le(&data, 0x1020).unwrap(), -(0x50));
        // nk signature right after the header
        assert_eq!(&data[0x1024..0x1026], b"nk");
        // Cell size is a multiple of 8
        assert_eq!(ROOT_KEY_CELL_SIZE % 8, 0);
    }

    #[test]
    fn test_root_key_cell_bounds() {
        let mut data = vec![0u8; 0x30];
        assert!(write_root_key_cell(&mut data, 0x20, 0).is_err());
    }
}
