//! Segregated-fit size classes.
//!
//! Free cells are bucketed by size: a linear phase with fixed-width classes
//! for small cells, then geometrically growing classes up to the large-cell
//! cutoff. Cells at or beyond the cutoff are kept in a separate large list
//! and never bucketed. Class lookup is a binary search over the upper-bound
//! table.

use crate::codec::{align_cell, CELL_ALIGN};

/// Shape of the size-class table.
///
/// Fixed for the lifetime of an allocator; tuning happens at construction.
#[derive(Debug, Clone, Copy)]
pub struct SizeClassConfig {
    /// Width of each class in the linear phase. Multiple of 8.
    pub linear_step: usize,

    /// Upper bound of the linear phase. Multiple of `linear_step`.
    pub linear_limit: usize,

    /// Growth factor of the geometric phase. Greater than 1.
    pub growth_factor: f64,

    /// Sizes at or beyond this live in the large list. Default 16 KiB.
    pub large_cutoff: usize,
}

impl Default for SizeClassConfig {
    /// The balanced default: 8-byte classes to 256, then 1.5x growth to
    /// 16 KiB, around forty classes in total.
    fn default() -> Self {
        Self {
            linear_step: 8,
            linear_limit: 256,
            growth_factor: 1.5,
            large_cutoff: 16 * 1024,
        }
    }
}

/// The materialized class table.
#[derive(Debug, Clone)]
pub struct SizeClasses {
    /// Inclusive upper bound of each class, ascending.
    uppers: Vec<u32>,
    large_cutoff: u32,
}

impl SizeClasses {
    /// Builds the class table from a config.
    ///
    /// # Panics
    ///
    /// Panics if the config is malformed (zero or misaligned step, factor
    /// not above 1, cutoff not beyond the linear phase). Config errors are
    /// programming errors, not runtime conditions.
    pub fn new(config: &SizeClassConfig) -> Self {
        assert!(config.linear_step > 0 && config.linear_step % CELL_ALIGN == 0);
        assert!(config.linear_limit >= config.linear_step);
        assert!(config.linear_limit % config.linear_step == 0);
        assert!(config.growth_factor > 1.0);
        assert!(config.large_cutoff > config.linear_limit);
        assert!(config.large_cutoff % CELL_ALIGN == 0);

        let mut uppers = Vec::new();
        let mut bound = config.linear_step;
        while bound <= config.linear_limit {
            uppers.push(bound as u32);
            bound += config.linear_step;
        }

        let mut geometric = config.linear_limit as f64;
        loop {
            geometric *= config.growth_factor;
            let aligned = align_cell(geometric as usize);
            if aligned >= config.large_cutoff {
                break;
            }
            uppers.push(aligned as u32);
        }

        // The final class tops out just under the cutoff.
        let top = (config.large_cutoff - CELL_ALIGN) as u32;
        if *uppers.last().expect("at least one class") < top {
            uppers.push(top);
        }

        Self {
            uppers,
            large_cutoff: config.large_cutoff as u32,
        }
    }

    /// Builds the balanced default table.
    pub fn balanced() -> Self {
        Self::new(&SizeClassConfig::default())
    }

    /// Number of classes.
    pub fn count(&self) -> usize {
        self.uppers.len()
    }

    /// Sizes at or beyond this belong in the large list.
    pub fn large_cutoff(&self) -> u32 {
        self.large_cutoff
    }

    /// True if `size` belongs in the large list rather than a class.
    pub fn is_large(&self, size: u32) -> bool {
        size >= self.large_cutoff
    }

    /// The class holding cells of `size`, or `None` for large cells.
    ///
    /// O(log C) binary search over the upper-bound table.
    pub fn class_for(&self, size: u32) -> Option<usize> {
        if self.is_large(size) {
            return None;
        }
        let idx = self.uppers.partition_point(|&upper| upper < size);
        debug_assert!(idx < self.uppers.len());
        Some(idx)
    }

    /// Inclusive upper bound of a class.
    pub fn upper_bound(&self, class: usize) -> u32 {
        self.uppers[class]
    }
}
