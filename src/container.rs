//! Hive container: file-level layout, buffering, and structural access.
//!
//! The container owns the hive's byte buffer and the underlying file. It
//! validates the REGF/HBIN structure on open, creates minimal bootable
//! hives, grows and shrinks the file, and writes dirty intervals on commit.
//! It never mutates cell contents or the sequence protocol; those belong to
//! the allocators and the transaction manager respectively.

use crate::codec::{read_i32_le, HBIN_START_OFFSET, PAGE_SIZE};
use crate::dirty::DirtyTracker;
use crate::error::{HiveError, Result};
use crate::hbin::{write_hbin_header, HbinCellIterator, HbinHeader, HBIN_HEADER_SIZE};
use crate::header::{self, BaseBlock, BASE_BLOCK_SIZE, REGF_SIGNATURE};
use crate::cell::{write_root_key_cell, ROOT_KEY_CELL_SIZE};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Minimum valid hive file: base block plus one hbin.
pub const MIN_HIVE_SIZE: usize = BASE_BLOCK_SIZE + PAGE_SIZE;

/// The REGF format caps hive files at 2 GiB: hbin offset fields are
/// 32-bit values relative to 0x1000.
pub const MAX_HIVE_SIZE: u64 = i32::MAX as u64;

/// Cell reference of the root key cell in a freshly created hive.
pub const ROOT_CELL_REF: u32 = 0x20;

/// An open hive container.
///
/// The container is the exclusive owner of the hive bytes. Mutating
/// components borrow the buffer for the duration of each operation; no
/// slice into the buffer may be retained across `append`, which can
/// reallocate it.
#[derive(Debug)]
pub struct Container {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    base_block: BaseBlock,
}

impl Container {
    /// Opens an existing hive file and validates its structure.
    ///
    /// Validation covers the REGF signature, version, checksum, hbin
    /// contiguity and signatures, 4KB size multiples, and the header data
    /// size. Trailing bytes beyond `0x1000 + data size` are truncated from
    /// the file, matching the recovery behavior of registry loaders.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or fails structural
    /// validation.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening hive container");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;

        let metadata = file.metadata()?;
        let file_size = metadata.len() as usize;
        if file_size < MIN_HIVE_SIZE {
            return Err(HiveError::HiveTooSmall {
                size: file_size,
                minimum: MIN_HIVE_SIZE,
            });
        }

        // SAFETY: the mapping is used only for this initial read; the
        // working copy below is owned, so later file resizes never touch
        // mapped memory. The file descriptor stays valid for the mapping's
        // lifetime and no mutable access aliases it.
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(size = mmap.len(), "Memory mapped hive for validation");

        let base_block = BaseBlock::parse(&mmap)?;

        if base_block.data_size == 0 || base_block.data_size as usize % PAGE_SIZE != 0 {
            return Err(HiveError::InvalidFormat(format!(
                "Data size {:#x} is not a positive multiple of 4KB",
                base_block.data_size
            )));
        }

        let expected_len = BASE_BLOCK_SIZE + base_block.data_size as usize;
        if file_size < expected_len {
            return Err(HiveError::TruncatedData {
                offset: file_size as u32,
                expected: expected_len,
                actual: file_size,
            });
        }

        let buf = mmap[..expected_len].to_vec();
        drop(mmap);

        if file_size > expected_len {
            // Trailing slack beyond the declared data size: registry
            // loaders discard it, and so do we.
            warn!(
                trailing = file_size - expected_len,
                "Truncating trailing bytes beyond data size"
            );
            file.set_len(expected_len as u64)?;
        }

        validate_hbin_structure(&buf, base_block.data_size)?;

        info!(
            data_size = base_block.data_size,
            version = format!("{}.{}", base_block.major_version, base_block.minor_version),
            "Hive container opened"
        );

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            buf,
            base_block,
        })
    }

    /// Creates a minimal bootable hive at `path`.
    ///
    /// The new hive has a REGF header with fresh sequences (1/1), one 4KB
    /// hbin, a minimal root key cell at cell reference 0x20, and a master
    /// free cell covering the rest of the hbin. The file is written and
    /// synced before the container is returned.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Creating new hive container");
        let mut buf = vec![0u8; MIN_HIVE_SIZE];
        let now = header::filetime_now();

        // Base block
        buf[0..4].copy_from_slice(REGF_SIGNATURE);
        header::set_primary_sequence(&mut buf, 1)?;
        header::set_secondary_sequence(&mut buf, 1)?;
        header::set_timestamp(&mut buf, now)?;
        crate::codec::write_u32_le(&mut buf, 0x14, 1)?; // major version
        crate::codec::write_u32_le(&mut buf, 0x18, 3)?; // minor version
        crate::codec::write_u32_le(&mut buf, 0x1C, 0)?; // file type: primary
        crate::codec::write_u32_le(&mut buf, 0x20, 1)?; // format: memory load
        crate::codec::write_u32_le(&mut buf, header::ROOT_CELL_OFFSET, ROOT_CELL_REF)?;
        header::set_data_size(&mut buf, PAGE_SIZE as u32)?;
        crate::codec::write_u32_le(&mut buf, 0x2C, 1)?; // clustering factor

        let name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        header::set_file_name(&mut buf, &name)?;

        // First hbin with the root key cell and the master free cell
        write_hbin_header(&mut buf, BASE_BLOCK_SIZE, PAGE_SIZE as u32)?;
        let root_abs = BASE_BLOCK_SIZE + HBIN_HEADER_SIZE;
        write_root_key_cell(&mut buf, root_abs, now)?;

        let free_abs = root_abs + ROOT_KEY_CELL_SIZE;
        let free_size = PAGE_SIZE - HBIN_HEADER_SIZE - ROOT_KEY_CELL_SIZE;
        crate::codec::write_i32_le(&mut buf, free_abs, free_size as i32)?;

        header::write_checksum(&mut buf)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;

        let base_block = BaseBlock::parse(&buf)?;
        debug!(data_size = base_block.data_size, "Hive created");

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            buf,
            base_block,
        })
    }

    /// The path this container was opened or created at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Immutable view of the hive bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable view of the hive bytes.
    ///
    /// Callers must register every modified range with the dirty tracker
    /// themselves; the container does not watch writes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Current buffer (and file) length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if the container holds no bytes (never the case once open).
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The base block snapshot taken when the hive was opened or created.
    ///
    /// Field mutations made after open (sequences, data size) are visible
    /// in the buffer, not in this snapshot; re-parse with
    /// [`BaseBlock::parse`] after a commit for a fresh view.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// Extends the buffer and the file by `n` zero bytes.
    ///
    /// # Arguments
    ///
    /// * `n` - Number of bytes to append; must be a multiple of 4KB.
    ///
    /// # Errors
    ///
    /// `InvalidFormat` when `n` is not page-aligned, `GrowDenied` when the
    /// resulting file would exceed the 2 GiB format limit, `Io` when the
    /// file cannot be extended (the buffer is restored to its previous
    /// length in that case).
    pub fn append(&mut self, n: usize) -> Result<()> {
        if n == 0 || n % PAGE_SIZE != 0 {
            return Err(HiveError::InvalidFormat(format!(
                "Append of {:#x} bytes is not a multiple of 4KB",
                n
            )));
        }
        let new_len = self.buf.len() + n;
        if new_len as u64 > MAX_HIVE_SIZE {
            return Err(HiveError::GrowDenied {
                requested: new_len as u64,
                limit: MAX_HIVE_SIZE,
            });
        }

        self.buf.resize(new_len, 0);
        if let Err(e) = self.file.set_len(new_len as u64) {
            // Keep buffer and file consistent on failure.
            self.buf.truncate(new_len - n);
            return Err(e.into());
        }
        debug!(n, new_len, "Container appended");
        Ok(())
    }

    /// Shrinks the buffer and the file to `new_len` bytes.
    ///
    /// # Errors
    ///
    /// `TruncateDenied` when `new_len` would cut into the base block or the
    /// first hbin, or is not page-aligned.
    pub fn truncate(&mut self, new_len: usize) -> Result<()> {
        if new_len < MIN_HIVE_SIZE {
            return Err(HiveError::TruncateDenied(format!(
                "New length {:#x} is below the minimum hive size {:#x}",
                new_len, MIN_HIVE_SIZE
            )));
        }
        if new_len % PAGE_SIZE != 0 {
            return Err(HiveError::TruncateDenied(format!(
                "New length {:#x} is not a multiple of 4KB",
                new_len
            )));
        }
        if new_len > self.buf.len() {
            return Err(HiveError::TruncateDenied(format!(
                "New length {:#x} exceeds current size {:#x}",
                new_len,
                self.buf.len()
            )));
        }

        self.file.set_len(new_len as u64)?;
        self.buf.truncate(new_len);
        debug!(new_len, "Container truncated");
        Ok(())
    }

    /// Reads the data-size header field.
    pub fn data_size(&self) -> Result<u32> {
        header::data_size(&self.buf)
    }

    /// Overwrites the data-size header field.
    pub fn set_data_size(&mut self, value: u32) -> Result<()> {
        header::set_data_size(&mut self.buf, value)
    }

    /// Adjusts the data-size header field by `delta` bytes.
    pub fn bump_data_size(&mut self, delta: i64) -> Result<()> {
        let current = i64::from(self.data_size()?);
        let next = current + delta;
        if next < 0 || next > MAX_HIVE_SIZE as i64 {
            return Err(HiveError::InvalidFormat(format!(
                "Data size adjustment by {} from {} out of range",
                delta, current
            )));
        }
        self.set_data_size(next as u32)
    }

    /// Returns a restartable iterator over `(absolute offset, size)` of
    /// every hbin in the hive.
    pub fn hbins(&self) -> HbinIter<'_> {
        HbinIter {
            data: &self.buf,
            cursor: BASE_BLOCK_SIZE,
        }
    }

    /// Returns an iterator over the cells of the hbin at `hbin_abs`.
    pub fn cells(&self, hbin_abs: usize, hbin_size: usize) -> HbinCellIterator<'_> {
        HbinCellIterator::new(&self.buf, hbin_abs, hbin_size)
    }

    /// Reads the raw signed size field of the cell at `abs_offset`.
    pub fn cell_size_at(&self, abs_offset: usize) -> Result<i32> {
        read_i32_le(&self.buf, abs_offset)
    }

    /// Writes the given dirty ranges to disk and syncs.
    ///
    /// Ranges at or beyond 0x1000 (structural data) are written before any
    /// range inside the base block, so the sequence protocol fields land
    /// last; the fsync completes the commit ordering.
    pub fn flush(&mut self, dirty: &DirtyTracker) -> Result<()> {
        let mut header_ranges = Vec::new();
        for range in dirty.iter() {
            if range.start >= u64::from(HBIN_START_OFFSET) {
                self.write_range(range.start, range.end)?;
            } else {
                header_ranges.push(range);
            }
        }
        for range in header_ranges {
            self.write_range(range.start, range.end)?;
        }
        self.file.sync_all()?;
        debug!(ranges = dirty.len(), bytes = dirty.dirty_bytes(), "Flushed dirty ranges");
        Ok(())
    }

    fn write_range(&mut self, start: u64, end: u64) -> Result<()> {
        let len = self.buf.len() as u64;
        let start = start.min(len);
        let end = end.min(len);
        if start >= end {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&self.buf[start as usize..end as usize])?;
        Ok(())
    }

    /// Syncs file contents and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Restartable iterator over hbin `(absolute offset, size)` pairs.
pub struct HbinIter<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Iterator for HbinIter<'a> {
    type Item = Result<(usize, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.data.len() {
            return None;
        }

        let expected = (self.cursor - BASE_BLOCK_SIZE) as u32;
        match HbinHeader::parse(&self.data[self.cursor..], expected) {
            Ok(header) => {
                let item = (self.cursor, header.size as usize);
                self.cursor += header.size as usize;
                Some(Ok(item))
            }
            Err(e) => {
                self.cursor = self.data.len();
                Some(Err(e))
            }
        }
    }
}

/// Walks every hbin and checks contiguity, signatures, sizes, and the sum
/// against the header data-size field.
fn validate_hbin_structure(buf: &[u8], declared_data_size: u32) -> Result<()> {
    let mut cursor = BASE_BLOCK_SIZE;
    let mut total = 0usize;

    while cursor < buf.len() {
        let expected = (cursor - BASE_BLOCK_SIZE) as u32;
        let header = HbinHeader::parse(&buf[cursor..], expected)?;
        let size = header.size as usize;
        if cursor + size > buf.len() {
            return Err(HiveError::InvalidFormat(format!(
                "Hbin at {:#x} overruns the file ({:#x} bytes)",
                cursor, size
            )));
        }
        total += size;
        cursor += size;
    }

    if total != declared_data_size as usize {
        return Err(HiveError::InvalidFormat(format!(
            "Hbin sizes sum to {:#x} but header declares {:#x}",
            total, declared_data_size
        )));
    }
    Ok(())
}
