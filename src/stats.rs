//! Per-hbin packing-efficiency accounting.
//!
//! The allocator keeps one [`HbinState`] per hbin; this module turns those
//! records into an [`EfficiencyStats`] report: overall totals, a fixed
//! histogram of efficiency bands, and the k worst-packed hbins selected
//! with a bounded max-heap in O(n log k).

use crate::hbin::HBIN_HEADER_SIZE;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Live accounting for one hbin.
#[derive(Debug, Clone, Copy)]
pub struct HbinState {
    /// Usable cell space: hbin size minus the 32-byte header.
    pub usable: u32,

    /// Bytes currently held by allocated cells.
    pub allocated_bytes: u64,

    /// Number of allocations ever placed in this hbin.
    pub alloc_count: u64,
}

impl HbinState {
    /// Creates accounting for an hbin with `usable` cell bytes.
    pub fn new(usable: u32) -> Self {
        Self {
            usable,
            allocated_bytes: 0,
            alloc_count: 0,
        }
    }

    /// The hbin's total on-disk size, header included.
    pub fn hbin_size(&self) -> u32 {
        self.usable + HBIN_HEADER_SIZE as u32
    }

    /// Packing efficiency in basis points (10000 = fully packed).
    pub fn efficiency_bp(&self) -> u32 {
        if self.usable == 0 {
            return 0;
        }
        let bp = self.allocated_bytes.saturating_mul(10_000) / u64::from(self.usable);
        bp.min(10_000) as u32
    }
}

/// Efficiency of a single hbin, as reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HbinEfficiency {
    /// Absolute file offset of the hbin.
    pub offset: u32,

    /// Usable cell bytes.
    pub usable: u32,

    /// Bytes held by allocated cells.
    pub allocated: u64,

    /// Allocations ever placed here.
    pub alloc_count: u64,

    /// Packing efficiency in basis points.
    pub efficiency_bp: u32,
}

/// Histogram bands, best to worst: 100%, 99-99.9, 98-98.9, 95-97.9,
/// 80-94.9, below 80.
pub const HISTOGRAM_BANDS: usize = 6;

/// Aggregate efficiency report.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EfficiencyStats {
    /// Number of hbins.
    pub hbin_count: usize,

    /// Sum of usable bytes over all hbins.
    pub total_usable: u64,

    /// Sum of allocated bytes over all hbins.
    pub total_allocated: u64,

    /// Sum of allocation counts over all hbins.
    pub total_allocs: u64,

    /// Hbin counts per efficiency band (see [`HISTOGRAM_BANDS`]).
    pub histogram: [u64; HISTOGRAM_BANDS],

    /// The k worst hbins, worst first.
    pub worst: Vec<HbinEfficiency>,
}

impl EfficiencyStats {
    /// Overall packing efficiency in basis points.
    pub fn overall_bp(&self) -> u32 {
        if self.total_usable == 0 {
            return 0;
        }
        let bp = self.total_allocated.saturating_mul(10_000) / self.total_usable;
        bp.min(10_000) as u32
    }
}

fn band_for(bp: u32) -> usize {
    match bp {
        10_000 => 0,
        9_900..=9_999 => 1,
        9_800..=9_899 => 2,
        9_500..=9_799 => 3,
        8_000..=9_499 => 4,
        _ => 5,
    }
}

/// Builds the report from per-hbin records.
///
/// The worst-k selection keeps a bounded max-heap of size `k`: each hbin is
/// pushed, and the best-of-the-worst is evicted once the heap is full.
pub(crate) fn build_efficiency_stats(
    hbins: impl Iterator<Item = (u32, HbinState)>,
    k: usize,
) -> EfficiencyStats {
    let mut stats = EfficiencyStats {
        hbin_count: 0,
        total_usable: 0,
        total_allocated: 0,
        total_allocs: 0,
        histogram: [0; HISTOGRAM_BANDS],
        worst: Vec::new(),
    };

    // Max-heap on (efficiency, offset); the root is the least-bad entry
    // currently kept, so exceeding k evicts it.
    let mut heap: BinaryHeap<(u32, Reverse<u32>)> = BinaryHeap::new();
    let mut kept: Vec<HbinEfficiency> = Vec::new();

    for (offset, state) in hbins {
        let bp = state.efficiency_bp();
        stats.hbin_count += 1;
        stats.total_usable += u64::from(state.usable);
        stats.total_allocated += state.allocated_bytes;
        stats.total_allocs += state.alloc_count;
        stats.histogram[band_for(bp)] += 1;

        if k == 0 {
            continue;
        }
        heap.push((bp, Reverse(offset)));
        kept.push(HbinEfficiency {
            offset,
            usable: state.usable,
            allocated: state.allocated_bytes,
            alloc_count: state.alloc_count,
            efficiency_bp: bp,
        });
        if heap.len() > k {
            let (evict_bp, Reverse(evict_off)) = heap.pop().expect("heap not empty");
            kept.retain(|e| !(e.efficiency_bp == evict_bp && e.offset == evict_off));
        }
    }

    kept.sort_by_key(|e| (e.efficiency_bp, e.offset));
    stats.worst = kept;
    stats
}
