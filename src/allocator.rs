//! Segregated best-fit cell allocator.
//!
//! This is the engine's core: it owns the free-cell index and performs
//! every structural mutation of the cell space. Allocation pops the
//! smallest fitting cell from the segregated heaps (with a bounded
//! good-enough scan when the top of the request's own class is too small),
//! splits off remainders of 8 bytes or more, and grows the hive by whole
//! hbins under pressure. Freeing flips the sign in place and coalesces
//! with free neighbors, never across an hbin boundary.
//!
//! The allocator writes only structural bytes: cell headers, hbin headers,
//! the data-size field, and the checksum after growth or truncation. The
//! sequence protocol belongs to the transaction manager.

use crate::cell::{CellClass, CellRef, CELL_HEADER_SIZE, MIN_PAYLOAD};
use crate::codec::{
    align_cell, cell_ref_to_absolute, read_i32_le, write_i32_le, HBIN_START_OFFSET, PAGE_SIZE,
};
use crate::container::Container;
use crate::dirty::DirtyTracker;
use crate::error::{HiveError, Result};
use crate::free_index::FreeIndex;
use crate::hbin::{write_hbin_header, HBIN_HEADER_SIZE};
use crate::header;
use crate::size_class::{SizeClassConfig, SizeClasses};
use crate::stats::{build_efficiency_stats, EfficiencyStats, HbinState};
use std::collections::BTreeMap;
use std::env;
use tracing::{debug, trace, warn};

/// Environment variable enabling verbose allocator tracing.
pub const LOG_ALLOC_ENV: &str = "HIVE_LOG_ALLOC";

/// Allocator tuning knobs, fixed for the allocator's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct AllocConfig {
    /// Maximum heap entries inspected by the slow-path scan.
    pub scan_limit: usize,

    /// A slow-path candidate within this many bytes of the request is
    /// taken immediately ("good enough").
    pub fit_tolerance: u32,

    /// Shape of the size-class table.
    pub size_classes: SizeClassConfig,

    /// Emit per-operation trace events.
    pub verbose: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            scan_limit: 32,
            fit_tolerance: 64,
            size_classes: SizeClassConfig::default(),
            verbose: false,
        }
    }
}

impl AllocConfig {
    /// Default config with the verbose flag read from `HIVE_LOG_ALLOC`.
    ///
    /// The environment is consulted once, here; operations never touch it.
    pub fn from_env() -> Self {
        let verbose = env::var_os(LOG_ALLOC_ENV).is_some_and(|v| !v.is_empty());
        Self {
            verbose,
            ..Self::default()
        }
    }
}

/// The allocation contract shared by the segregated and bump allocators.
///
/// Every mutation borrows the container and the dirty tracker for its
/// duration. The payload slice returned by [`alloc`](Self::alloc) borrows
/// the container mutably, so it cannot be retained across a later mutation
/// that might grow (and reallocate) the buffer.
pub trait CellAllocator {
    /// Allocates a cell of at least `need` bytes (header included).
    ///
    /// `need` is rounded up to a multiple of 8. Returns the cell reference
    /// and the payload slice, which excludes the 4-byte size header.
    fn alloc<'c>(
        &mut self,
        container: &'c mut Container,
        dirty: &mut DirtyTracker,
        need: usize,
        class: CellClass,
    ) -> Result<(CellRef, &'c mut [u8])>;

    /// Releases the cell at `cell_ref`. Freeing an already-free cell is a
    /// no-op that returns success.
    fn free(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        cell_ref: CellRef,
    ) -> Result<()>;

    /// Appends `pages` fresh 4KB pages as a single new hbin.
    fn grow_by_pages(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        pages: usize,
    ) -> Result<()>;

    /// Grows by the smallest page count whose hbin can hold `need` cell
    /// bytes plus the 32-byte hbin header.
    fn grow(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        need: usize,
    ) -> Result<()> {
        let pages = (need + HBIN_HEADER_SIZE + PAGE_SIZE - 1) / PAGE_SIZE;
        self.grow_by_pages(container, dirty, pages.max(1))
    }

    /// Removes `pages` 4KB pages from the end of the hive. The range must
    /// consist of whole hbins holding no allocated cells.
    fn truncate_pages(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        pages: usize,
    ) -> Result<()>;
}

/// Segregated best-fit allocator with coalescing and growth.
pub struct SegAllocator {
    config: AllocConfig,
    index: FreeIndex,
    /// Absolute hbin start -> per-hbin record, ordered for range lookup.
    hbins: BTreeMap<u32, HbinState>,
}

impl SegAllocator {
    /// Attaches an allocator to an open container, scanning every hbin to
    /// build the free index and the per-hbin accounting.
    pub fn attach(container: &Container, config: AllocConfig) -> Result<Self> {
        let classes = SizeClasses::new(&config.size_classes);
        let mut allocator = Self {
            config,
            index: FreeIndex::new(classes),
            hbins: BTreeMap::new(),
        };

        for hbin in container.hbins() {
            let (hbin_abs, hbin_size) = hbin?;
            let mut state = HbinState::new(hbin_size as u32 - HBIN_HEADER_SIZE as u32);

            for cell in container.cells(hbin_abs, hbin_size) {
                let cell = match cell {
                    Ok(cell) => cell,
                    Err(e) => {
                        // A corrupt header ends this hbin's chain; the rest
                        // of its space stays unindexed but the hive remains
                        // usable.
                        warn!(hbin = format_args!("{:#x}", hbin_abs), error = %e, "cell walk stopped");
                        break;
                    }
                };
                if cell.is_allocated() {
                    state.allocated_bytes += cell.size() as u64;
                    state.alloc_count += 1;
                } else {
                    allocator.index.insert(cell.offset as u32, cell.size() as u32);
                }
            }
            allocator.hbins.insert(hbin_abs as u32, state);
        }

        debug!(
            hbins = allocator.hbins.len(),
            free_cells = allocator.index.len(),
            max_free = allocator.index.max_free(),
            "Allocator attached"
        );
        Ok(allocator)
    }

    /// The allocator's configuration.
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    /// Size of the largest free cell, 0 when none.
    pub fn max_free(&self) -> u32 {
        self.index.max_free()
    }

    /// Size of the second-largest distinct free cell size.
    pub fn second_max_free(&self) -> u32 {
        self.index.second_max_free()
    }

    /// Number of indexed free cells.
    pub fn free_cell_count(&self) -> usize {
        self.index.len()
    }

    /// Per-hbin packing efficiency, histogram, and the `k` worst hbins.
    pub fn efficiency_stats(&self, k: usize) -> EfficiencyStats {
        build_efficiency_stats(self.hbins.iter().map(|(&off, state)| (off, *state)), k)
    }

    /// The hbin `(start, state)` containing `abs`, by range lookup.
    fn hbin_containing(&self, abs: u32) -> Option<(u32, &HbinState)> {
        let (&start, state) = self.hbins.range(..=abs).next_back()?;
        if abs < start + state.hbin_size() {
            Some((start, state))
        } else {
            None
        }
    }

    /// Picks a free cell of at least `need` bytes, removing it from the
    /// index. Returns `(offset, size)`.
    fn take_fit(&mut self, need: u32) -> Option<(u32, u32)> {
        let classes = self.index.classes();
        if let Some(class) = classes.class_for(need) {
            // Fast path: the top of the request's own class is the
            // smallest cell in it. If it fits, nothing smaller exists.
            if let Some((offset, size)) = self.index.class_top(class) {
                if size >= need {
                    self.index.remove(offset);
                    return Some((offset, size));
                }
                // Slow path: the class range straddles the request, so a
                // deeper entry may still fit. Scan a bounded prefix for a
                // good-enough match; never exhaustively.
                if let Some((offset, size)) = self.bounded_scan(class, need) {
                    self.index.remove(offset);
                    return Some((offset, size));
                }
            }

            // Every cell in a higher class is at least that class's lower
            // bound, so any top fits.
            for higher in class + 1..self.index.classes().count() {
                if let Some((offset, size)) = self.index.class_top(higher) {
                    debug_assert!(size >= need);
                    self.index.remove(offset);
                    return Some((offset, size));
                }
            }
        }

        // Large list: smallest fitting entry.
        let mut best: Option<(u32, u32)> = None;
        for (offset, size) in self.index.large_entries() {
            if size >= need && best.map_or(true, |(_, b)| size < b) {
                best = Some((offset, size));
            }
        }
        if let Some((offset, _)) = best {
            self.index.remove(offset);
        }
        best
    }

    /// Scans up to `scan_limit` entries of `class` for a cell of at least
    /// `need` bytes. A candidate within `fit_tolerance` wins immediately;
    /// otherwise the smallest fitting candidate seen is returned.
    fn bounded_scan(&self, class: usize, need: u32) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        for (offset, size) in self.index.class_entries(class).take(self.config.scan_limit) {
            if size < need {
                continue;
            }
            if size - need <= self.config.fit_tolerance {
                return Some((offset, size));
            }
            if best.map_or(true, |(_, b)| size < b) {
                best = Some((offset, size));
            }
        }
        best
    }

    /// Validates that `abs` names a plausible cell header inside a known
    /// hbin and returns that hbin's bounds.
    fn cell_bounds_check(
        &self,
        container: &Container,
        abs: u32,
        size: u32,
    ) -> Result<(u32, u32)> {
        let (hbin_start, state) = self
            .hbin_containing(abs)
            .ok_or_else(|| HiveError::bad_cell_ref(abs - HBIN_START_OFFSET, container.len()))?;
        let hbin_end = hbin_start + state.hbin_size();
        let first_cell = hbin_start + HBIN_HEADER_SIZE as u32;
        if abs < first_cell || abs + size > hbin_end {
            return Err(HiveError::invalid_cell_size(size as i32, abs));
        }
        Ok((hbin_start, hbin_end))
    }
}

impl CellAllocator for SegAllocator {
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

        let chosen = match self.take_fit(need) {
            Some(fit) => fit,
            None => {
                // One growth round, then retry the search.
                self.grow(container, dirty, need as usize)?;
                self.take_fit(need).ok_or(HiveError::NoSpace {
                    need: need as usize,
                })?
            }
        };
        let (offset, found_size) = chosen;

        // Split policy: a remainder of 8 or more becomes a new free cell;
        // anything smaller is absorbed into the allocation.
        let remainder = found_size - need;
        let final_size = if remainder >= 8 {
            let tail = offset + need;
            write_i32_le(container.data_mut(), tail as usize, remainder as i32)?;
            dirty.add(u64::from(tail), CELL_HEADER_SIZE as u64);
            self.index.insert(tail, remainder);
            need
        } else {
            found_size
        };

        write_i32_le(container.data_mut(), offset as usize, -(final_size as i32))?;
        dirty.add(u64::from(offset), CELL_HEADER_SIZE as u64);

        if let Some((hbin_start, _)) = self.hbin_containing(offset) {
            let state = self.hbins.get_mut(&hbin_start).expect("hbin just looked up");
            state.allocated_bytes += u64::from(final_size);
            state.alloc_count += 1;
        }

        let cell_ref = offset - HBIN_START_OFFSET;
        if self.config.verbose {
            trace!(
                cell_ref = format_args!("{:#x}", cell_ref),
                need,
                size = final_size,
                split = remainder >= 8,
                class = class.name(),
                "alloc"
            );
        }

        let start = offset as usize + CELL_HEADER_SIZE;
        let end = offset as usize + final_size as usize;
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
            // Idempotent double-free.
            if self.config.verbose {
                trace!(cell_ref = format_args!("{:#x}", cell_ref), "free (already free)");
            }
            return Ok(());
        }
        let size = raw.unsigned_abs();
        if raw == 0 || size < 8 || size % 8 != 0 {
            return Err(HiveError::invalid_cell_size(raw, abs));
        }
        let (hbin_start, hbin_end) = self.cell_bounds_check(container, abs, size)?;

        write_i32_le(container.data_mut(), abs as usize, size as i32)?;
        dirty.add(u64::from(abs), CELL_HEADER_SIZE as u64);

        if let Some(state) = self.hbins.get_mut(&hbin_start) {
            state.allocated_bytes = state.allocated_bytes.saturating_sub(u64::from(size));
        }

        let mut start = abs;
        let mut merged = size;

        // Forward coalesce: the next header must begin strictly inside the
        // same hbin. Anything unindexed or implausible ends the merge.
        let next = abs + size;
        if next + CELL_HEADER_SIZE as u32 <= hbin_end {
            if let Some(next_size) = self.index.size_at(next) {
                if next + next_size <= hbin_end {
                    self.index.remove(next);
                    merged += next_size;
                } else {
                    warn!(
                        offset = format_args!("{:#x}", next),
                        size = next_size,
                        "free neighbor overruns hbin, skipping coalesce"
                    );
                }
            }
        }

        // Backward coalesce via the end map; a predecessor ending at our
        // start is necessarily inside the same hbin.
        if let Some(pred) = self.index.ending_at(start) {
            if pred >= hbin_start + HBIN_HEADER_SIZE as u32 {
                if let Some(pred_size) = self.index.remove(pred) {
                    start = pred;
                    merged += pred_size;
                }
            }
        }

        write_i32_le(container.data_mut(), start as usize, merged as i32)?;
        dirty.add(u64::from(start), CELL_HEADER_SIZE as u64);
        self.index.insert(start, merged);

        if self.config.verbose {
            trace!(
                cell_ref = format_args!("{:#x}", cell_ref),
                size,
                merged,
                merged_at = format_args!("{:#x}", start),
                "free"
            );
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

        self.index.insert(master_abs as u32, master_size);
        self.hbins
            .insert(hbin_abs as u32, HbinState::new(master_size));

        container.bump_data_size(hbin_size as i64)?;
        header::write_checksum(container.data_mut())?;

        dirty.add(0, header::BASE_BLOCK_SIZE as u64);
        dirty.add(hbin_abs as u64, hbin_size as u64);

        if self.config.verbose {
            trace!(
                hbin = format_args!("{:#x}", hbin_abs),
                pages,
                master_size,
                "grow"
            );
        }
        debug!(hbin_abs, hbin_size, "Hive grown by new hbin");
        Ok(())
    }

    fn truncate_pages(
        &mut self,
        container: &mut Container,
        dirty: &mut DirtyTracker,
        pages: usize,
    ) -> Result<()> {
        if pages == 0 {
            return Err(HiveError::NeedTooSmall {
                need: 0,
                minimum: 1,
            });
        }
        let cut = pages * PAGE_SIZE;
        let len = container.len();
        let new_len = len.checked_sub(cut).ok_or_else(|| {
            HiveError::TruncateDenied(format!(
                "Cannot cut {:#x} bytes from a {:#x} byte hive",
                cut, len
            ))
        })?;
        let boundary = new_len as u32;

        // The cut must start exactly at an hbin boundary; a partial hbin
        // would break contiguity for every reader.
        if !self.hbins.contains_key(&boundary) {
            return Err(HiveError::TruncateDenied(format!(
                "Offset {:#x} does not start an hbin",
                boundary
            )));
        }
        if boundary == HBIN_START_OFFSET {
            return Err(HiveError::TruncateDenied(
                "At least one hbin must remain".to_string(),
            ));
        }

        // Refuse if any allocated cell lives in the doomed range. The walk
        // is authoritative; the accounting map is not trusted here.
        for (&hbin_start, state) in self.hbins.range(boundary..) {
            for cell in container.cells(hbin_start as usize, state.hbin_size() as usize) {
                let cell = cell?;
                if cell.is_allocated() {
                    return Err(HiveError::TruncateDenied(format!(
                        "Allocated cell at {:#x} inside the truncation range",
                        cell.offset
                    )));
                }
            }
        }

        self.index.remove_in_range(boundary, len as u32);
        let doomed: Vec<u32> = self.hbins.range(boundary..).map(|(&s, _)| s).collect();
        for start in doomed {
            self.hbins.remove(&start);
        }

        container.truncate(new_len)?;
        container.bump_data_size(-(cut as i64))?;
        header::write_checksum(container.data_mut())?;
        dirty.add(0, header::BASE_BLOCK_SIZE as u64);

        if self.config.verbose {
            trace!(pages, new_len, "truncate");
        }
        debug!(pages, new_len, "Hive truncated");
        Ok(())
    }
}
