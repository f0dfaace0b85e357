//! Transaction manager: the sequence/timestamp protocol and commit flush.
//!
//! A transaction brackets a batch of allocator mutations. `begin` bumps the
//! primary sequence so any crash mid-transaction leaves primary !=
//! secondary, which readers treat as an unclean hive. `commit` closes the
//! bracket: secondary catches up, the timestamp and checksum are refreshed,
//! and the dirty intervals are flushed with the header written last.
//!
//! The manager is the only writer of the sequence and timestamp fields;
//! structural fields (data size, cells, the checksum after growth) belong
//! to the allocators. There is no rollback: a failed mutation leaves the
//! transaction open and the caller decides whether to commit what
//! succeeded or abandon the in-memory state.

use crate::container::Container;
use crate::dirty::DirtyTracker;
use crate::error::{HiveError, Result};
use crate::header::{self, BASE_BLOCK_SIZE};
use tracing::{debug, info, instrument};

/// Brackets allocator mutations with the REGF sequence protocol.
#[derive(Debug, Default)]
pub struct TxnManager {
    open: bool,
}

impl TxnManager {
    /// Creates a manager with no open transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a transaction is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Opens a transaction: primary sequence += 1, header marked dirty.
    ///
    /// Returns the new primary sequence number.
    ///
    /// # Errors
    ///
    /// `TransactionOpen` if a transaction is already in flight.
    pub fn begin(&mut self, container: &mut Container, dirty: &mut DirtyTracker) -> Result<u32> {
        if self.open {
            let primary = header::primary_sequence(container.data())?;
            return Err(HiveError::TransactionOpen { primary });
        }

        let primary = header::primary_sequence(container.data())?.wrapping_add(1);
        header::set_primary_sequence(container.data_mut(), primary)?;
        dirty.add(0, BASE_BLOCK_SIZE as u64);
        self.open = true;

        debug!(primary, "Transaction opened");
        Ok(primary)
    }

    /// Commits the open transaction.
    ///
    /// Secondary sequence catches up to primary, the last-written timestamp
    /// is set to now, the checksum is recomputed over both structural and
    /// protocol updates, and the dirty set is flushed (structural ranges
    /// before the header, fsync last) and reset.
    ///
    /// # Errors
    ///
    /// `TransactionNotOpen` if no transaction is in flight; `Io` if the
    /// flush fails, in which case the transaction stays open and the dirty
    /// set is kept so a retry can flush again.
    #[instrument(skip(self, container, dirty))]
    pub fn commit(&mut self, container: &mut Container, dirty: &mut DirtyTracker) -> Result<()> {
        if !self.open {
            return Err(HiveError::TransactionNotOpen);
        }

        let primary = header::primary_sequence(container.data())?;
        header::set_secondary_sequence(container.data_mut(), primary)?;
        header::set_timestamp(container.data_mut(), header::filetime_now())?;
        header::write_checksum(container.data_mut())?;
        dirty.add(0, BASE_BLOCK_SIZE as u64);

        container.flush(dirty)?;
        dirty.reset();
        self.open = false;

        info!(sequence = primary, "Transaction committed");
        Ok(())
    }

    /// Abandons the open transaction without writing anything to disk.
    ///
    /// The primary sequence is restored to the secondary and the dirty set
    /// is discarded. Structural mutations made during the transaction
    /// remain in the in-memory buffer but will never be flushed by this
    /// manager; callers wanting a clean slate should reopen the hive.
    pub fn abandon(&mut self, container: &mut Container, dirty: &mut DirtyTracker) -> Result<()> {
        if !self.open {
            return Err(HiveError::TransactionNotOpen);
        }

        let secondary = header::secondary_sequence(container.data())?;
        header::set_primary_sequence(container.data_mut(), secondary)?;
        header::write_checksum(container.data_mut())?;
        dirty.reset();
        self.open = false;

        debug!(sequence = secondary, "Transaction abandoned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BaseBlock;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, Container, TxnManager, DirtyTracker) {
        let dir = tempdir().unwrap();
        let container = Container::create(dir.path().join("HIVE")).unwrap();
        (dir, container, TxnManager::new(), DirtyTracker::new())
    }

    #[test]
    fn test_begin_bumps_primary_only() {
        let (_dir, mut container, mut txn, mut dirty) = fresh();
        let primary = txn.begin(&mut container, &mut dirty).unwrap();
        assert_eq!(primary, 2);
        assert_eq!(header::primary_sequence(container.data()).unwrap(), 2);
        assert_eq!(header::secondary_sequence(container.data()).unwrap(), 1);
        assert!(txn.is_open());
        assert!(!dirty.is_empty());
    }

    #[test]
    fn test_begin_twice_fails() {
        let (_dir, mut container, mut txn, mut dirty) = fresh();
        txn.begin(&mut container, &mut dirty).unwrap();
        let err = txn.begin(&mut container, &mut dirty).unwrap_err();
        assert!(matches!(err, HiveError::TransactionOpen { primary: 2 }));
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let (_dir, mut container, mut txn, mut dirty) = fresh();
        let err = txn.commit(&mut container, &mut dirty).unwrap_err();
        assert!(matches!(err, HiveError::TransactionNotOpen));
    }

    #[test]
    fn test_commit_cycle() {
        let (_dir, mut container, mut txn, mut dirty) = fresh();
        let stamp_before = container.base_block().last_written;

        txn.begin(&mut container, &mut dirty).unwrap();
        txn.commit(&mut container, &mut dirty).unwrap();

        assert!(!txn.is_open());
        assert!(dirty.is_empty());

        let block = BaseBlock::parse(container.data()).unwrap();
        assert_eq!(block.primary_sequence, 2);
        assert_eq!(block.secondary_sequence, 2);
        assert!(block.is_consistent());
        assert!(block.last_written >= stamp_before);
    }

    #[test]
    fn test_commit_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HIVE");
        {
            let mut container = Container::create(&path).unwrap();
            let mut txn = TxnManager::new();
            let mut dirty = DirtyTracker::new();
            txn.begin(&mut container, &mut dirty).unwrap();
            txn.commit(&mut container, &mut dirty).unwrap();
        }

        let container = Container::open(&path).unwrap();
        let block = container.base_block();
        assert_eq!(block.primary_sequence, 2);
        assert_eq!(block.secondary_sequence, 2);
    }

    #[test]
    fn test_abandon_restores_primary() {
        let (_dir, mut container, mut txn, mut dirty) = fresh();
        txn.begin(&mut container, &mut dirty).unwrap();
        txn.abandon(&mut container, &mut dirty).unwrap();

        assert!(!txn.is_open());
        assert!(dirty.is_empty());
        assert_eq!(header::primary_sequence(container.data()).unwrap(), 1);

        // A new transaction can open afterwards
        assert_eq!(txn.begin(&mut container, &mut dirty).unwrap(), 2);
    }

    #[test]
    fn test_unflushed_begin_not_visible_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HIVE");
        {
            let mut container = Container::create(&path).unwrap();
            let mut txn = TxnManager::new();
            let mut dirty = DirtyTracker::new();
            txn.begin(&mut container, &mut dirty).unwrap();
            // Dropped without commit: nothing was flushed
        }

        let container = Container::open(&path).unwrap();
        assert_eq!(container.base_block().primary_sequence, 1);
        assert!(container.base_block().is_consistent());
    }
}
