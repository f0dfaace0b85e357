//! Registry hive base block (header) parsing and mutation.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, the
//! root key cell reference, and the sequence numbers used to detect torn
//! writes. The write side of this module mutates header fields directly in
//! the container's byte buffer so that the on-disk dword layout stays
//! bit-exact.

use crate::codec::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};
use crate::error::{HiveError, Result};
use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the primary sequence number.
pub const PRIMARY_SEQUENCE_OFFSET: usize = 0x04;

/// Offset of the secondary sequence number.
pub const SECONDARY_SEQUENCE_OFFSET: usize = 0x08;

/// Offset of the last-written timestamp (Windows FILETIME, 8 bytes).
pub const TIMESTAMP_OFFSET: usize = 0x0C;

/// Offset of the root cell reference (relative to 0x1000).
pub const ROOT_CELL_OFFSET: usize = 0x24;

/// Offset of the hive data size field (sum of all hbin sizes).
pub const DATA_SIZE_OFFSET: usize = 0x28;

/// Offset of the embedded file name (64 UTF-16LE code units = 128 bytes).
const FILE_NAME_OFFSET: usize = 0x30;

/// Length of the file name field in bytes.
const FILE_NAME_LENGTH: usize = 128;

/// Offset of the checksum field.
pub const CHECKSUM_OFFSET: usize = 0x1FC;

/// Difference between the FILETIME epoch (1601) and the Unix epoch (1970)
/// in seconds.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Registry hive base block header.
///
/// This structure is a parsed snapshot of the first 4KB of a hive file.
/// The engine mutates the live header through the `set_*` functions below,
/// which write directly into the container buffer; `BaseBlock::parse` is
/// used on open and for validation after commit.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf" (0x66676572).
    pub signature: [u8; 4],

    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = primary, 1 = transaction log). Values outside 0/1 are
    /// preserved verbatim.
    pub file_type: u32,

    /// File format (1 = direct memory load). Preserved verbatim.
    pub file_format: u32,

    /// Reference to the root key cell (relative to 0x1000).
    pub root_cell_offset: u32,

    /// Length of hive bin data in bytes (sum of all hbin sizes).
    pub data_size: u32,

    /// Clustering factor. Informational, preserved verbatim.
    pub clustering_factor: u32,

    /// File name (embedded, up to 64 UTF-16LE code units).
    pub file_name: String,

    /// Checksum (XOR of the first 0x1FC bytes as dwords).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes of the base block (must be at least 4096 bytes).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Checksum doesn't match
    /// - Version is unsupported
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(HiveError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(HiveError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        let primary_sequence = read_u32_le(data, PRIMARY_SEQUENCE_OFFSET)?;
        let secondary_sequence = read_u32_le(data, SECONDARY_SEQUENCE_OFFSET)?;
        let last_written = read_u64_le(data, TIMESTAMP_OFFSET)?;
        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, ROOT_CELL_OFFSET)?;
        let data_size = read_u32_le(data, DATA_SIZE_OFFSET)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        let file_name = decode_file_name(&data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH]);

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;
        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(HiveError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        // Support 1.3 through 1.6
        if major_version != 1 || minor_version < 3 || minor_version > 6 {
            return Err(HiveError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            data_size,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when primary and secondary sequence numbers
    /// match; a mismatch means a transaction was in flight when the hive
    /// was last written.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a UTC datetime.
    pub fn last_written_datetime(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.last_written)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell: {:#x}\n\
             - Data Size: {} bytes\n\
             - Sequences: {}/{}\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.data_size,
            self.primary_sequence,
            self.secondary_sequence,
            self.is_consistent(),
            self.file_name
        )
    }
}

/// Calculates the XOR checksum over the first 0x1FC bytes of the base block.
///
/// The checksum field itself (at 0x1FC) is excluded.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;
    for i in (0..CHECKSUM_OFFSET).step_by(4) {
        if let Ok(dword) = read_u32_le(data, i) {
            checksum ^= dword;
        }
    }
    checksum
}

/// Recomputes and stores the header checksum. Returns the stored value.
pub fn write_checksum(data: &mut [u8]) -> Result<u32> {
    if data.len() < BASE_BLOCK_SIZE {
        return Err(HiveError::HiveTooSmall {
            size: data.len(),
            minimum: BASE_BLOCK_SIZE,
        });
    }
    let checksum = calculate_checksum(data);
    write_u32_le(data, CHECKSUM_OFFSET, checksum)?;
    Ok(checksum)
}

/// Reads the primary sequence number from a header buffer.
pub fn primary_sequence(data: &[u8]) -> Result<u32> {
    read_u32_le(data, PRIMARY_SEQUENCE_OFFSET)
}

/// Reads the secondary sequence number from a header buffer.
pub fn secondary_sequence(data: &[u8]) -> Result<u32> {
    read_u32_le(data, SECONDARY_SEQUENCE_OFFSET)
}

/// Writes the primary sequence number into a header buffer.
pub fn set_primary_sequence(data: &mut [u8], value: u32) -> Result<()> {
    write_u32_le(data, PRIMARY_SEQUENCE_OFFSET, value)
}

/// Writes the secondary sequence number into a header buffer.
pub fn set_secondary_sequence(data: &mut [u8], value: u32) -> Result<()> {
    write_u32_le(data, SECONDARY_SEQUENCE_OFFSET, value)
}

/// Writes the last-written timestamp (Windows FILETIME) into a header buffer.
pub fn set_timestamp(data: &mut [u8], filetime: u64) -> Result<()> {
    write_u64_le(data, TIMESTAMP_OFFSET, filetime)
}

/// Reads the hive data-size field from a header buffer.
pub fn data_size(data: &[u8]) -> Result<u32> {
    read_u32_le(data, DATA_SIZE_OFFSET)
}

/// Writes the hive data-size field into a header buffer.
pub fn set_data_size(data: &mut [u8], value: u32) -> Result<()> {
    write_u32_le(data, DATA_SIZE_OFFSET, value)
}

/// Returns the current time as a Windows FILETIME (100ns ticks since 1601).
pub fn filetime_now() -> u64 {
    let now = Utc::now();
    let secs = now.timestamp() + FILETIME_UNIX_DIFF;
    let ticks = secs as u64 * 10_000_000 + u64::from(now.timestamp_subsec_nanos()) / 100;
    ticks
}

/// Converts a Windows FILETIME to a UTC datetime.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

/// Decodes the embedded UTF-16LE file name, trimming trailing nulls.
fn decode_file_name(data: &[u8]) -> String {
    let (decoded, _, _) = UTF_16LE.decode(data);
    decoded.trim_end_matches('\0').to_string()
}

/// Encodes a file name into the fixed 128-byte UTF-16LE header field.
///
/// Names longer than 64 code units are truncated.
pub fn encode_file_name(name: &str) -> [u8; FILE_NAME_LENGTH] {
    let mut field = [0u8; FILE_NAME_LENGTH];
    let mut pos = 0;
    for unit in name.encode_utf16() {
        if pos + 2 > FILE_NAME_LENGTH {
            break;
        }
        field[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
        pos += 2;
    }
    field
}

/// Writes the embedded file-name field into a header buffer.
pub fn set_file_name(data: &mut [u8], name: &str) -> Result<()> {
    if data.len() < FILE_NAME_OFFSET + FILE_NAME_LENGTH {
        return Err(HiveError::HiveTooSmall {
            size: data.len(),
            minimum: FILE_NAME_OFFSET + FILE_NAME_LENGTH,
        });
    }
    data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH]
        .copy_from_slice(&encode_file_name(name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_header() -> Vec<u8> {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(&mut data, 0x14, 1).unwrap(); // major
        write_u32_le(&mut data, 0x18, 5).unwrap(); // minor
        write_u32_le(&mut data, 0x20, 1).unwrap(); // format
        write_u32_le(&mut data, 0x2C, 1).unwrap(); // clustering
        data
    }

    #[test]
    fn test_base_block_size() {
        assert_eq!(BASE_BLOCK_SIZE, 4096);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), HiveError::InvalidSignature { .. }));
    }

    #[test]
    fn test_too_small() {
        let data = vec![0u8; 100];
        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), HiveError::HiveTooSmall { .. }));
    }

    #[test]
    fn test_checksum_validation() {
        let mut data = blank_header();
        write_checksum(&mut data).unwrap();
        assert!(BaseBlock::parse(&data).is_ok());

        // Corrupt one dword; parse must reject
        write_u32_le(&mut data, 0x28, 0xDEAD_BEEF).unwrap();
        let result = BaseBlock::parse(&data);
        assert!(matches!(result.unwrap_err(), HiveError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_sequence_setters() {
        let mut data = blank_header();
        set_primary_sequence(&mut data, 7).unwrap();
        set_secondary_sequence(&mut data, 6).unwrap();
        write_checksum(&mut data).unwrap();

        let block = BaseBlock::parse(&data).unwrap();
        assert_eq!(block.primary_sequence, 7);
        assert_eq!(block.secondary_sequence, 6);
        assert!(!block.is_consistent());
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = blank_header();
        write_u32_le(&mut data, 0x18, 7).unwrap(); // minor out of range
        write_checksum(&mut data).unwrap();
        let result = BaseBlock::parse(&data);
        assert!(matches!(result.unwrap_err(), HiveError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_filetime_roundtrip() {
        // 2020-01-01T00:00:00Z as FILETIME
        let filetime = 132_223_104_000_000_000u64;
        let dt = filetime_to_datetime(filetime).unwrap();
        assert_eq!(dt.timestamp(), 1_577_836_800);
    }

    #[test]
    fn test_filetime_now_is_recent() {
        // Must be after 2020 in FILETIME ticks
        assert!(filetime_now() > 132_223_104_000_000_000u64);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let mut data = blank_header();
        set_file_name(&mut data, "SYSTEM").unwrap();
        write_checksum(&mut data).unwrap();
        let block = BaseBlock::parse(&data).unwrap();
        assert_eq!(block.file_name, "SYSTEM");
    }
}
