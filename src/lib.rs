//! # Windows Registry Hive Storage Engine
//!
//! A transactional storage engine for Windows registry hive files: the
//! REGF/HBIN container, cell allocation, dirty-region tracking, and
//! commit-boundary consistency.
//!
//! ## Features
//!
//! - **Byte-exact format**: containers stay readable by third-party tools
//!   (hivexsh, offline forensic parsers) after every mutation
//! - **Segregated best-fit allocator**: per-size-class min-heaps, adjacent
//!   cell coalescing, splitting, and page-aligned growth and truncation
//! - **Append-only bump allocator**: the same contract for single-pass
//!   builds and merges, byte-compatible output
//! - **Minimal commits**: a dirty-interval tracker so a commit writes only
//!   what changed, with the sequence protocol ordered for crash detection
//!
//! ## Architecture
//!
//! The engine is built on several layers:
//!
//! 1. **Base Block (Header)**: hive metadata, sequence numbers, checksum
//! 2. **Hive Bins (hbin)**: 4KB-aligned blocks containing cells
//! 3. **Cells**: variable-sized allocation units with signed size headers
//! 4. **Allocators**: segregated best-fit or append-only bump placement
//! 5. **Transactions**: sequence/timestamp protocol around mutations
//!
//! ## Binary Layout
//!
//! Registry hives follow this structure:
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, timestamps, root cell reference
//!   - Data size, checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size, contiguous, 8-byte aligned]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Payload]
//! ```
//!
//! ## Examples
//!
//! ### Allocating cells transactionally
//!
//! ```no_run
//! use reg_engine::{
//!     AllocConfig, CellAllocator, CellClass, Container, DirtyTracker, SegAllocator, TxnManager,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut container = Container::create("NEWHIVE")?;
//! let mut allocator = SegAllocator::attach(&container, AllocConfig::from_env())?;
//! let mut dirty = DirtyTracker::new();
//! let mut txn = TxnManager::new();
//!
//! txn.begin(&mut container, &mut dirty)?;
//! let (cell_ref, payload) = allocator.alloc(&mut container, &mut dirty, 256, CellClass::RawData)?;
//! payload.fill(0);
//! println!("allocated cell {:#x}", cell_ref);
//! txn.commit(&mut container, &mut dirty)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Inspecting an existing hive
//!
//! ```no_run
//! use reg_engine::Container;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let container = Container::open("SYSTEM")?;
//! println!("{}", container.base_block());
//! for hbin in container.hbins() {
//!     let (offset, size) = hbin?;
//!     println!("hbin at {:#x}, {} bytes", offset, size);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bump;
pub mod cell;
pub mod codec;
pub mod container;
pub mod dirty;
pub mod error;
pub mod free_index;
pub mod hbin;
pub mod header;
pub mod size_class;
pub mod stats;
pub mod txn;

// Re-export main types for convenience
pub use allocator::{AllocConfig, CellAllocator, SegAllocator, LOG_ALLOC_ENV};
pub use bump::BumpAllocator;
pub use cell::{CellClass, CellRef};
pub use container::Container;
pub use dirty::{DirtyRange, DirtyTracker};
pub use error::{HiveError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use size_class::{SizeClassConfig, SizeClasses};
pub use stats::{EfficiencyStats, HbinEfficiency};
pub use txn::TxnManager;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
