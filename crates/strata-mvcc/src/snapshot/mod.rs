//! Snapshots: a consistent view of which transactions are visible.
//!
//! A snapshot captures, at a point in time, the set of transactions whose
//! effects a reader may observe:
//!
//! 1. The frozen xid is always visible.
//! 2. The owner's own writes are visible.
//! 3. A xid assigned at or after the snapshot (`xid >= xmax`) is invisible.
//! 4. A xid that was in progress when the snapshot was taken is invisible.
//! 5. Otherwise the xid is visible iff it committed.
//!
//! Rule 5 consults the transaction manager at check time: a transaction
//! that was finished-but-unresolved at snapshot time has a definite state
//! by the time anyone asks.

use std::collections::HashSet;

use strata_common::types::TxnId;

use crate::xact::TransactionManager;

/// A consistent view of transaction visibility.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Transaction that owns this snapshot (INVALID for standalone reads).
    owner: TxnId,
    /// First xid *not* visible to this snapshot.
    xmax: TxnId,
    /// Transactions in progress when the snapshot was taken.
    active: HashSet<TxnId>,
    /// Whether the owner runs at the serializable isolation level.
    serializable: bool,
}

impl Snapshot {
    /// Creates a snapshot. Normally called via
    /// [`TransactionManager::begin`](crate::xact::TransactionManager::begin)
    /// or [`snapshot_now`](crate::xact::TransactionManager::snapshot_now).
    #[must_use]
    pub fn new(
        owner: TxnId,
        xmax: TxnId,
        active: HashSet<TxnId>,
        serializable: bool,
    ) -> Self {
        Self {
            owner,
            xmax,
            active,
            serializable,
        }
    }

    /// Returns the owning transaction id (INVALID for standalone reads).
    #[inline]
    #[must_use]
    pub fn owner(&self) -> TxnId {
        self.owner
    }

    /// True if the owner runs serializable.
    #[inline]
    #[must_use]
    pub fn is_serializable(&self) -> bool {
        self.serializable
    }

    /// Decides whether the effects of `xid` are visible to this snapshot.
    pub fn sees_xid(&self, xid: TxnId, txns: &TransactionManager) -> bool {
        if xid == TxnId::FROZEN {
            return true;
        }
        if !xid.is_valid() {
            return false;
        }
        if xid == self.owner {
            return true;
        }
        if xid >= self.xmax {
            return false;
        }
        if self.active.contains(&xid) {
            return false;
        }
        txns.is_committed(xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_visible() {
        let txns = TransactionManager::new();
        let snap = Snapshot::new(TxnId::INVALID, TxnId::new(100), HashSet::new(), false);
        assert!(snap.sees_xid(TxnId::FROZEN, &txns));
    }

    #[test]
    fn test_own_writes_visible() {
        let txns = TransactionManager::new();
        let me = TxnId::new(7);
        let snap = Snapshot::new(me, TxnId::new(8), HashSet::new(), false);
        assert!(snap.sees_xid(me, &txns));
    }

    #[test]
    fn test_future_xid_invisible() {
        let txns = TransactionManager::new();
        let txn = txns.begin();
        txns.commit(txn.xid()).unwrap();
        // Even committed, a xid at/after xmax is invisible.
        let snap = Snapshot::new(TxnId::INVALID, txn.xid(), HashSet::new(), false);
        assert!(!snap.sees_xid(txn.xid(), &txns));
    }

    #[test]
    fn test_active_set_invisible() {
        let txns = TransactionManager::new();
        let txn = txns.begin();
        txns.commit(txn.xid()).unwrap();
        let mut active = HashSet::new();
        active.insert(txn.xid());
        // In the active set at snapshot time: invisible regardless of the
        // later commit.
        let snap = Snapshot::new(TxnId::INVALID, TxnId::new(100), active, false);
        assert!(!snap.sees_xid(txn.xid(), &txns));
    }

    #[test]
    fn test_committed_visible_aborted_not() {
        let txns = TransactionManager::new();
        let committed = txns.begin();
        let aborted = txns.begin();
        txns.commit(committed.xid()).unwrap();
        txns.abort(aborted.xid()).unwrap();

        let snap = Snapshot::new(TxnId::INVALID, TxnId::new(100), HashSet::new(), false);
        assert!(snap.sees_xid(committed.xid(), &txns));
        assert!(!snap.sees_xid(aborted.xid(), &txns));
    }

    #[test]
    fn test_invalid_xid_invisible() {
        let txns = TransactionManager::new();
        let snap = Snapshot::new(TxnId::INVALID, TxnId::new(100), HashSet::new(), false);
        assert!(!snap.sees_xid(TxnId::INVALID, &txns));
    }
}
