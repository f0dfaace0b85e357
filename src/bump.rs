//! Append-only bump allocator.
//!
//! The bump allocator shares the [`CellAllocator`] contract but keeps no
//! free index: it writes every cell at the bump pointer, growing a fresh
//! hbin when the current one cannot fit the request. Freed cells get their
//! sign flipped and become permanent dead space. This matches the strategy
//! of single-pass build and merge tools, and for equivalent append-only
//! operation sequences it produces containers byte-identical to the
//! segregated allocator's.

use crate::allocator::{AllocConfig, CellAllocator};
use crate::cell::{CellClass, CellRef, CELL_HEADER_SIZE, MIN_PAYLOAD};
use crate::codec::{align_cell, align_page, cell_ref_to_absolute, read_i32_le, write_i32_le, HBIN_START_OFFSET, PAGE_SIZE};
use crate::container::Container;
use crate::dirty::DirtyTracker;
use crate::error::{HiveError, Result};
use crate::hbin::{write_hbin_header, HBIN_HEADER_SIZE};
use crate::header;
use tracing::{debug, trace, warn};

/// Append-only allocator: a bump pointer inside the trailing hbin.
pub struct BumpAllocator {
    config: AllocConfig,
    /// Absolute offset where the next cell will be written.
    end_blocks: u32,
    /// Absolute end of the current (last) hbin.
    end_pages: u32,
}

impl BumpAllocator {
    /// Attaches to an open container, positioning the bump pointer at the
    /// trailing free cell of the last hbin (or at its end if full).
    pub fn attach(container: &Container, config: AllocConfig) -> Result<Self> {
        let mut last: Option<(usize, usize)> = None;
        for hbin in container.hbins() {
            last = Some(hbin?);
        }
        let (hbin_abs, hbin_size) = last.ok_or_else(|| {
            HiveError::InvalidFormat("Hive contains no hbins".to_string())
        })?;
        let end_pages = (hbin_abs + hbin_size) as u32;

        let mut end_blocks = end_pages;
        for cell in container.cells(hbin_abs, hbin_size) {
            let cell = match cell {
                Ok(cell) => cell,
                Err(e) => {
                    warn!(hbin = format_args!("{:#x}", hbin_abs), error = %e, "cell walk stopped");
                    break;
                }
            };
            end_blocks = if cell.is_allocated() {
                (cell.offset + cell.size()) as u32
            } else {
                cell.offset as u32
            };
        }

        debug!(
            end_blocks = format_args!("{:#x}", end_blocks),
            end_pages = format_args!("{:#x}", end_pages),
            "Bump allocator attached"
        );
        Ok(Self {
            config,
            end_blocks,
            end_pages,
        })
    }

    /// Remaining bytes in the current hbin.
    pub fn remaining(&self) -> u32 {
        self.end_pages - self.end_blocks
    }
}

impl CellAllocator for BumpAllocator {
    fn alloc<'c>(
        &mut self,
        container: &'c mut Container,
        dirty: &mut DirtyTracker,
        need: usize,
        class: CellClass,
    ) -> Result<(CellRef, &'c mut [u8])> {
        if need < MIN_PAYLOAD {
            return Err(HiveError::NeedTooSmall {
                need,
                minimum: MIN_PAYLOAD,
            });
        }
        if need > i32::MAX as usize {
            return Err(HiveError::NoSpace { need });
        }
        let need = align_cell(need) as u32;

        if self.end_blocks + need > self.end_pages {
            // The remainder of the current hbin already carries its free
            // header; it simply stays behind as dead space.
            let pages = align_page(need as usize + HBIN_HEADER_SIZE) / PAGE_SIZE;
            self.grow_by_pages(container, dirty, pages)?;
        }

        let offset = self.end_blocks;
        write_i32_le(container.data_mut(), offset as usize, -(need as i32))?;
        dirty.add(u64::from(offset), CELL_HEADER_SIZE as u64);
        self.end_blocks += need;

        let remainder = self.end_pages - self.end_blocks;
        if remainder >= 8 {
            write_i32_le(container.data_mut(), self.end_blocks as usize, remainder as i32)?;
            dirty.add(u64::from(self.end_blocks), CELL_HEADER_SIZE as u64);
        }

        let cell_ref = offset - HBIN_START_OFFSET;
        if self.config.verbose {
            trace!(
                cell_ref = format_args!("{:#x}", cell_ref),
                size = need,
                class = class.name(),
                "bump alloc"
            );
        }

        let start = offset as usize + CELL_HEADER_SIZE;
        let end = offset as usize + need as usize;
        let payload = &mut Container::data_mut(container)[start..end];
        Ok((cell_ref, payload))
    }

    fn free(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        cell_ref: CellRef,
    ) -> Result<()> {
        let abs = cell_ref_to_absolute(cell_ref)?;
        if abs as usize + CELL_HEADER_SIZE > container.len() || abs % 8 != 0 {
            return Err(HiveError::bad_cell_ref(cell_ref, container.len()));
        }

        let raw = read_i32_le(container.data(), abs as usize)?;
        if raw > 0 {
            return Ok(());
        }
        let size = raw.unsigned_abs();
        if raw == 0 || size < 8 || size % 8 != 0 || abs as usize + size as usize > container.len() {
            return Err(HiveError::invalid_cell_size(raw, abs));
        }

        // Sign flip only: the space is never reused.
        write_i32_le(container.data_mut(), abs as usize, size as i32)?;
        dirty.add(u64::from(abs), CELL_HEADER_SIZE as u64);
        if self.config.verbose {
            trace!(cell_ref = format_args!("{:#x}", cell_ref), "bump free");
        }
        Ok(())
    }

    fn grow_by_pages(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        pages: usize,
    ) -> Result<()> {
        if pages == 0 {
            return Err(HiveError::InvalidFormat(
                "Growth of zero pages".to_string(),
            ));
        }
        let hbin_size = pages * PAGE_SIZE;
        let hbin_abs = container.len();

        container.append(hbin_size)?;

        let data = container.data_mut();
        write_hbin_header(data, hbin_abs, hbin_size as u32)?;
        let master_abs = hbin_abs + HBIN_HEADER_SIZE;
        let master_size = (hbin_size - HBIN_HEADER_SIZE) as u32;
        write_i32_le(data, master_abs, master_size as i32)?;

        container.bump_data_size(hbin_size as i64)?;
        header::write_checksum(container.data_mut())?;

        dirty.add(0, header::BASE_BLOCK_SIZE as u64);
        dirty.add(hbin_abs as u64, hbin_size as u64);

        self.end_blocks = master_abs as u32;
        self.end_pages = (hbin_abs + hbin_size) as u32;

        debug!(hbin_abs, hbin_size, "Bump allocator grew by new hbin");
        Ok(())
    }

    fn truncate_pages(
        &mut self,
        _container: &mut Container,
        _dirty: &mut DirtyTracker,
        _pages: usize,
    ) -> Result<()> {
        // Append-only: nothing is ever given back.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ROOT_KEY_CELL_SIZE;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, Container, BumpAllocator, DirtyTracker) {
        let dir = tempdir().unwrap();
        let container = Container::create(dir.path().join("HIVE")).unwrap();
        let allocator = BumpAllocator::attach(&container, AllocConfig::default()).unwrap();
        (dir, container, allocator, DirtyTracker::new())
    }

    #[test]
    fn test_attach_points_at_master_free_cell() {
        let (_dir, _container, allocator, _) = fresh();
        assert_eq!(
            allocator.end_blocks as usize,
            0x1000 + HBIN_HEADER_SIZE + ROOT_KEY_CELL_SIZE
        );
        assert_eq!(allocator.end_pages, 0x2000);
    }

    #[test]
    fn test_alloc_advances_and_marks_remainder() {
        let (_dir, mut container, mut allocator, mut dirty) = fresh();
        let (cell_ref, _) = allocator
            .alloc(&mut container, &mut dirty, 64, CellClass::RawData)
            .unwrap();

        let abs = cell_ref_to_absolute(cell_ref).unwrap() as usize;
        assert_eq!(container.cell_size_at(abs).unwrap(), -64);
        // The remainder right behind carries a positive free header
        let remainder = container.cell_size_at(abs + 64).unwrap();
        assert!(remainder > 0);
        assert_eq!(
            abs + 64 + remainder as usize,
            0x2000,
            "remainder must reach the hbin end"
        );
    }

    #[test]
    fn test_free_is_sign_flip_only() {
        let (_dir, mut container, mut allocator, mut dirty) = fresh();
        let (r1, _) = allocator
            .alloc(&mut container, &mut dirty, 64, CellClass::RawData)
            .unwrap();
        let end_before = allocator.end_blocks;
        allocator.free(&mut container, &mut dirty, r1).unwrap();

        let abs = cell_ref_to_absolute(r1).unwrap() as usize;
        assert_eq!(container.cell_size_at(abs).unwrap(), 64);
        // Dead space: the pointer did not move back
        assert_eq!(allocator.end_blocks, end_before);

        // And a second alloc does not reuse it
        let (r2, _) = allocator
            .alloc(&mut container, &mut dirty, 64, CellClass::RawData)
            .unwrap();
        assert!(r2 > r1);
    }

    #[test]
    fn test_grow_when_hbin_exhausted() {
        let (_dir, mut container, mut allocator, mut dirty) = fresh();
        let big = PAGE_SIZE; // cannot fit in the first hbin's remainder
        let (cell_ref, _) = allocator
            .alloc(&mut container, &mut dirty, big, CellClass::BigData)
            .unwrap();

        let abs = cell_ref_to_absolute(cell_ref).unwrap();
        assert_eq!(abs, 0x2000 + HBIN_HEADER_SIZE as u32);
        assert_eq!(container.len(), 0x2000 + 2 * PAGE_SIZE);
        assert_eq!(
            container.data_size().unwrap() as usize,
            PAGE_SIZE + 2 * PAGE_SIZE
        );
    }

    #[test]
    fn test_truncate_is_noop() {
        let (_dir, mut container, mut allocator, mut dirty) = fresh();
        let len = container.len();
        allocator
            .truncate_pages(&mut container, &mut dirty, 4)
            .unwrap();
        assert_eq!(container.len(), len);
    }

    #[test]
    fn test_exact_fill_leaves_no_remainder() {
        let (_dir, mut container, mut allocator, mut dirty) = fresh();
        let remaining = allocator.remaining() as usize;
        let (_, payload) = allocator
            .alloc(&mut container, &mut dirty, remaining, CellClass::RawData)
            .unwrap();
        assert_eq!(payload.len(), remaining - CELL_HEADER_SIZE);
        assert_eq!(allocator.remaining(), 0);
    }
}
