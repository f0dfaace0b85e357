//! Hive bin (hbin) block parsing and mutation.
//!
//! Hive bins are 4KB-aligned blocks that contain registry cells. Each hbin
//! has a 32-byte header followed by a sequence of cells that exactly fill
//! the remaining space.

use crate::codec::{read_i32_le, read_u32_le, write_u32_le, HBIN_START_OFFSET, PAGE_SIZE};
use crate::error::{HiveError, Result};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hive bin header structure.
///
/// Each hbin contains a header followed by registry cells. Hbins are always
/// aligned to 4KB boundaries and sized in 4KB multiples.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Signature, should be "hbin" (0x6E696268).
    pub signature: [u8; 4],

    /// Offset of this hbin relative to the start of the hive bins (0x1000).
    pub offset: u32,

    /// Size of this hbin in bytes (including header).
    pub size: u32,

    /// Reserved fields.
    pub reserved: [u32; 2],

    /// Timestamp (Windows FILETIME).
    pub timestamp: u64,

    /// Spare field.
    pub spare: u32,
}

impl HbinHeader {
    /// Parses an hbin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Expected value of the relative-offset field.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Offset field doesn't match the hbin's actual position
    /// - Size is zero or not a multiple of 4KB
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(HiveError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != HBIN_SIGNATURE {
            return Err(HiveError::invalid_signature(HBIN_SIGNATURE, &signature));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(HiveError::InvalidFormat(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        if size == 0 || size as usize % PAGE_SIZE != 0 {
            return Err(HiveError::InvalidFormat(format!(
                "Hbin size {:#x} at offset {:#x} is not a positive multiple of 4KB",
                size, offset
            )));
        }

        let reserved = [read_u32_le(data, 0x0C)?, read_u32_le(data, 0x10)?];

        let timestamp =
            u64::from(read_u32_le(data, 0x14)?) | (u64::from(read_u32_le(data, 0x18)?) << 32);

        let spare = read_u32_le(data, 0x1C)?;

        Ok(HbinHeader {
            signature,
            offset,
            size,
            reserved,
            timestamp,
            spare,
        })
    }

    /// Returns the size of the cell area (excluding the header).
    pub fn usable_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }
}

/// Writes a fresh hbin header into `data` at `hbin_abs` (absolute offset).
///
/// The relative-offset field is derived from the absolute position; reserved
/// fields, timestamp, and spare are zeroed.
///
/// # Arguments
///
/// * `data` - The full hive buffer.
/// * `hbin_abs` - Absolute file offset of the hbin (4KB aligned, >= 0x1000).
/// * `size` - Total hbin size in bytes (multiple of 4KB).
pub fn write_hbin_header(data: &mut [u8], hbin_abs: usize, size: u32) -> Result<()> {
    if hbin_abs < HBIN_START_OFFSET as usize || hbin_abs % PAGE_SIZE != 0 {
        return Err(HiveError::InvalidFormat(format!(
            "Hbin offset {:#x} is not 4KB aligned past the base block",
            hbin_abs
        )));
    }
    if hbin_abs + HBIN_HEADER_SIZE > data.len() {
        return Err(HiveError::TruncatedData {
            offset: hbin_abs as u32,
            expected: HBIN_HEADER_SIZE,
            actual: data.len().saturating_sub(hbin_abs),
        });
    }

    data[hbin_abs..hbin_abs + 4].copy_from_slice(HBIN_SIGNATURE);
    write_u32_le(data, hbin_abs + 0x04, hbin_abs as u32 - HBIN_START_OFFSET)?;
    write_u32_le(data, hbin_abs + 0x08, size)?;
    for field in (hbin_abs + 0x0C..hbin_abs + HBIN_HEADER_SIZE).step_by(4) {
        write_u32_le(data, field, 0)?;
    }
    Ok(())
}

/// A raw cell sighted while walking an hbin.
#[derive(Debug, Clone, Copy)]
pub struct CellInfo {
    /// Absolute file offset of the cell header.
    pub offset: usize,

    /// Raw signed size field: negative = allocated, positive = free.
    pub raw_size: i32,
}

impl CellInfo {
    /// The cell's full size in bytes (header included).
    pub fn size(&self) -> usize {
        self.raw_size.unsigned_abs() as usize
    }

    /// Whether the cell is allocated (negative size field).
    pub fn is_allocated(&self) -> bool {
        self.raw_size < 0
    }
}

/// Iterator over cells within one hbin.
///
/// Walks from the first cell (hbin + 32) toward the hbin end, yielding each
/// header it can read. Terminates at the first zero size field, at the hbin
/// end, or at a size that would escape the hbin (corruption guard).
pub struct HbinCellIterator<'a> {
    data: &'a [u8],
    cursor: usize,
    hbin_end: usize,
}

impl<'a> HbinCellIterator<'a> {
    /// Creates a cell iterator for the hbin starting at `hbin_abs`.
    ///
    /// # Arguments
    ///
    /// * `data` - The full hive buffer.
    /// * `hbin_abs` - Absolute offset of the hbin header.
    /// * `hbin_size` - Total hbin size in bytes.
    pub fn new(data: &'a [u8], hbin_abs: usize, hbin_size: usize) -> Self {
        let hbin_end = (hbin_abs + hbin_size).min(data.len());
        Self {
            data,
            cursor: hbin_abs + HBIN_HEADER_SIZE,
            hbin_end,
        }
    }
}

impl<'a> Iterator for HbinCellIterator<'a> {
    type Item = Result<CellInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + 4 > self.hbin_end {
            return None;
        }

        let raw_size = match read_i32_le(self.data, self.cursor) {
            Ok(s) => s,
            Err(e) => return Some(Err(e)),
        };

        if raw_size == 0 {
            // End of cells
            return None;
        }

        let size = raw_size.unsigned_abs() as usize;
        let offset = self.cursor;

        if size < 8 || size % 8 != 0 {
            self.cursor = self.hbin_end; // Stop the walk
            return Some(Err(HiveError::invalid_cell_size(raw_size, offset as u32)));
        }

        if offset + size > self.hbin_end {
            self.cursor = self.hbin_end;
            return Some(Err(HiveError::invalid_cell_size(raw_size, offset as u32)));
        }

        self.cursor = offset + size;
        Some(Ok(CellInfo { offset, raw_size }))
    }
}
