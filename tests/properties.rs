//! Property tests: random alloc/free sequences must preserve the
//! structural invariants after every single operation.

mod common;

use common::assert_structural_invariants;
use proptest::prelude::*;
use reg_engine::{
    AllocConfig, CellAllocator, CellClass, Container, DirtyTracker, SegAllocator, TxnManager,
};
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    /// Free the nth live cell (modulo the live count).
    Free(u8),
    /// Free the nth live cell twice in a row.
    DoubleFree(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (4usize..600).prop_map(Op::Alloc),
        1 => any::<u8>().prop_map(Op::Free),
        1 => any::<u8>().prop_map(Op::DoubleFree),
    ]
}

/// Counts free cells on disk and returns `(count, max_size)`.
fn scan_free_cells(container: &Container) -> (usize, u32) {
    let mut count = 0;
    let mut max = 0u32;
    for hbin in container.hbins() {
        let (hbin_abs, hbin_size) = hbin.unwrap();
        for cell in container.cells(hbin_abs, hbin_size) {
            let cell = cell.unwrap();
            if !cell.is_allocated() {
                count += 1;
                max = max.max(cell.size() as u32);
            }
        }
    }
    (count, max)
}

/// The allocator's index must agree with the bytes after every operation.
fn assert_index_consistency(container: &Container, allocator: &SegAllocator) {
    let (count, max) = scan_free_cells(container);
    assert_eq!(allocator.free_cell_count(), count, "free cell count");
    assert_eq!(allocator.max_free(), max, "max free size");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_alloc_free_preserves_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HIVE");
        let mut container = Container::create(&path).unwrap();
        let mut allocator = SegAllocator::attach(&container, AllocConfig::default()).unwrap();
        let mut dirty = DirtyTracker::new();
        let mut txn = TxnManager::new();
        txn.begin(&mut container, &mut dirty).unwrap();

        let mut live: Vec<u32> = Vec::new();

        for op in &ops {
            match op {
                Op::Alloc(size) => {
                    let (cell_ref, payload) = allocator
                        .alloc(&mut container, &mut dirty, *size, CellClass::RawData)
                        .unwrap();
                    let rounded = (*size + 7) & !7;
                    prop_assert!(payload.len() >= rounded - 4);
                    live.push(cell_ref);
                }
                Op::Free(sel) => {
                    if !live.is_empty() {
                        let idx = *sel as usize % live.len();
                        let cell_ref = live.swap_remove(idx);
                        allocator.free(&mut container, &mut dirty, cell_ref).unwrap();
                    }
                }
                Op::DoubleFree(sel) => {
                    if !live.is_empty() {
                        let idx = *sel as usize % live.len();
                        let cell_ref = live.swap_remove(idx);
                        allocator.free(&mut container, &mut dirty, cell_ref).unwrap();
                        let count = allocator.free_cell_count();
                        allocator.free(&mut container, &mut dirty, cell_ref).unwrap();
                        prop_assert_eq!(allocator.free_cell_count(), count);
                    }
                }
            }
            assert_structural_invariants(&container);
            assert_index_consistency(&container, &allocator);
        }

        // Committing and reopening yields the same picture.
        txn.commit(&mut container, &mut dirty).unwrap();
        let reopened = Container::open(&path).unwrap();
        assert_structural_invariants(&reopened);
        let reattached = SegAllocator::attach(&reopened, AllocConfig::default()).unwrap();
        prop_assert_eq!(reattached.free_cell_count(), allocator.free_cell_count());
        prop_assert_eq!(reattached.max_free(), allocator.max_free());
        prop_assert!(reopened.base_block().is_consistent());
    }

    #[test]
    fn alloc_free_pairs_return_to_baseline(sizes in prop::collection::vec(4usize..2000, 1..12)) {
        let dir = tempdir().unwrap();
        let mut container = Container::create(dir.path().join("HIVE")).unwrap();
        let mut allocator = SegAllocator::attach(&container, AllocConfig::default()).unwrap();
        let mut dirty = DirtyTracker::new();

        let baseline_max = allocator.max_free();
        let baseline_count = allocator.free_cell_count();

        let mut refs = Vec::new();
        for &size in &sizes {
            let (cell_ref, _) = allocator
                .alloc(&mut container, &mut dirty, size, CellClass::RawData)
                .unwrap();
            refs.push(cell_ref);
        }
        // Free in reverse order so everything coalesces back together
        for cell_ref in refs.into_iter().rev() {
            allocator.free(&mut container, &mut dirty, cell_ref).unwrap();
        }

        assert_structural_invariants(&container);
        assert_index_consistency(&container, &allocator);
        // The original hbin is one free span again (grown hbins keep their
        // own master spans)
        prop_assert!(allocator.max_free() >= baseline_max);
        prop_assert!(allocator.free_cell_count() >= baseline_count);
    }
}
