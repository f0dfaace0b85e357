//! Error types for hive storage operations.
//!
//! This module provides comprehensive error handling for all storage-engine
//! operations, including I/O errors, format violations, allocation failures,
//! and transaction protocol misuse.

use std::io;
use thiserror::Error;

/// Result type alias for hive storage operations.
pub type Result<T> = std::result::Result<T, HiveError>;

/// Errors that can occur in the hive storage engine.
#[derive(Error, Debug)]
pub enum HiveError {
    /// I/O error occurred while reading or writing the hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted structure.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        size: usize,
        minimum: usize,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        expected: u32,
        calculated: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        major: u32,
        minor: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Cell reference is out of bounds or misaligned.
    #[error("Bad cell reference: {reference:#x} (hive size: {hive_size:#x})")]
    BadCellRef {
        reference: u32,
        hive_size: usize,
    },

    /// Cell size field is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        size: i32,
        offset: u32,
    },

    /// Allocation request below the minimum payload size.
    #[error("Allocation too small: {need} bytes (minimum: {minimum} bytes)")]
    NeedTooSmall {
        need: usize,
        minimum: usize,
    },

    /// No free cell large enough and growth could not satisfy the request.
    #[error("No space for allocation of {need} bytes")]
    NoSpace {
        need: usize,
    },

    /// Growing the hive was denied (file size limit reached).
    #[error("Growth denied: {requested} bytes would exceed the {limit} byte hive limit")]
    GrowDenied {
        requested: u64,
        limit: u64,
    },

    /// Truncating the hive was denied.
    #[error("Truncation denied: {0}")]
    TruncateDenied(String),

    /// A transaction is already open.
    #[error("Transaction already open (primary sequence {primary})")]
    TransactionOpen {
        primary: u32,
    },

    /// No transaction is open.
    #[error("No transaction open")]
    TransactionNotOpen,
}

impl HiveError {
    /// Creates an invalid signature error with context.
    ///
    /// # Arguments
    ///
    /// * `expected` - Expected signature bytes
    /// * `found` - Actual signature bytes found
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates a bad cell reference error with context.
    ///
    /// # Arguments
    ///
    /// * `reference` - The offending cell reference
    /// * `hive_size` - Total size of the hive for context
    pub fn bad_cell_ref(reference: u32, hive_size: usize) -> Self {
        Self::BadCellRef {
            reference,
            hive_size,
        }
    }

    /// Creates an invalid cell size error with context.
    ///
    /// # Arguments
    ///
    /// * `size` - The invalid cell size
    /// * `offset` - Offset where the invalid size was found
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    ///
    /// # Arguments
    ///
    /// * `message` - Description of the format error
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }
}
