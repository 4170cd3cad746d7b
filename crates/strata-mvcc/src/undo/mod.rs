//! The append-only undo log.
//!
//! Every mutation of the TID tree emits one undo record describing how to
//! interpret (and, on abort, how to revert) the change. Records form
//! per-row chains through their `prev` pointers; a row item stores the
//! pointer to the newest record affecting it.
//!
//! Pointers are monotonically increasing counters, so "older than" is a
//! plain comparison. The log can be trimmed from the front once the
//! records are all-visible; a pointer below the trim point means "no
//! history, row visible to everyone".

use std::collections::VecDeque;

use parking_lot::RwLock;

use strata_common::types::{CommandId, Tid, TxnId, UndoPtr};

/// Row-level lock strength recorded in a `TupleLock` undo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// FOR KEY SHARE
    KeyShare,
    /// FOR SHARE
    Share,
    /// FOR NO KEY UPDATE
    NoKeyExclusive,
    /// FOR UPDATE
    Exclusive,
}

/// One record in the undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecord {
    /// Emitted by insert; covers the dense TID run `[tid, endtid]`.
    Insert {
        /// Inserting transaction.
        xid: TxnId,
        /// Command within the transaction.
        cid: CommandId,
        /// First TID of the inserted run.
        tid: Tid,
        /// Last TID of the inserted run (inclusive).
        endtid: Tid,
        /// Speculative-insertion token, 0 when not speculative.
        speculative_token: u32,
        /// Previous record in this row's chain.
        prev: UndoPtr,
    },

    /// Emitted by delete.
    Delete {
        /// Deleting transaction.
        xid: TxnId,
        /// Command within the transaction.
        cid: CommandId,
        /// The deleted TID.
        tid: Tid,
        /// Previous record in this row's chain.
        prev: UndoPtr,
        /// True when the row moved to another partition.
        changed_part: bool,
    },

    /// Emitted on the old row version by update.
    Update {
        /// Updating transaction.
        xid: TxnId,
        /// Command within the transaction.
        cid: CommandId,
        /// The old row version's TID.
        tid: Tid,
        /// Previous record in this row's chain.
        prev: UndoPtr,
        /// TID of the new row version.
        newtid: Tid,
        /// True when key columns changed.
        key_update: bool,
    },

    /// Emitted by an explicit row lock.
    TupleLock {
        /// Locking transaction.
        xid: TxnId,
        /// Command within the transaction.
        cid: CommandId,
        /// The locked TID.
        tid: Tid,
        /// Previous record in this row's chain.
        prev: UndoPtr,
        /// Requested lock strength.
        mode: LockMode,
    },
}

impl UndoRecord {
    /// The transaction that emitted this record.
    #[must_use]
    pub fn xid(&self) -> TxnId {
        match self {
            Self::Insert { xid, .. }
            | Self::Delete { xid, .. }
            | Self::Update { xid, .. }
            | Self::TupleLock { xid, .. } => *xid,
        }
    }

    /// The command id this record was emitted under.
    #[must_use]
    pub fn cid(&self) -> CommandId {
        match self {
            Self::Insert { cid, .. }
            | Self::Delete { cid, .. }
            | Self::Update { cid, .. }
            | Self::TupleLock { cid, .. } => *cid,
        }
    }

    /// The (first) TID this record describes.
    #[must_use]
    pub fn tid(&self) -> Tid {
        match self {
            Self::Insert { tid, .. }
            | Self::Delete { tid, .. }
            | Self::Update { tid, .. }
            | Self::TupleLock { tid, .. } => *tid,
        }
    }

    /// The previous record in this row's chain.
    #[must_use]
    pub fn prev(&self) -> UndoPtr {
        match self {
            Self::Insert { prev, .. }
            | Self::Delete { prev, .. }
            | Self::Update { prev, .. }
            | Self::TupleLock { prev, .. } => *prev,
        }
    }
}

#[derive(Debug)]
struct UndoLogInner {
    /// Counter value of the record *before* the first retained one.
    /// Record at queue index `i` has pointer `base + i + 1`.
    base: u64,
    records: VecDeque<UndoRecord>,
}

/// The append-only undo log of one relation.
#[derive(Debug)]
pub struct UndoLog {
    inner: RwLock<UndoLogInner>,
}

impl UndoLog {
    /// Creates an empty undo log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base(0)
    }

    /// Creates an empty undo log whose first record will get the pointer
    /// `base + 1`. Used when reopening a relation: pointers persisted on
    /// items must stay below every pointer a new record can get, so the
    /// old ones read as "discarded history, all-visible" instead of
    /// aliasing fresh records.
    #[must_use]
    pub fn with_base(base: u64) -> Self {
        Self {
            inner: RwLock::new(UndoLogInner {
                base,
                records: VecDeque::new(),
            }),
        }
    }

    /// The highest pointer handed out so far (0 when none ever was).
    pub fn high_water(&self) -> u64 {
        let inner = self.inner.read();
        inner.base + inner.records.len() as u64
    }

    /// Appends a record, returning its pointer.
    pub fn insert(&self, rec: UndoRecord) -> UndoPtr {
        let mut inner = self.inner.write();
        inner.records.push_back(rec);
        UndoPtr::new(inner.base + inner.records.len() as u64)
    }

    /// Fetches the record a pointer names, or `None` if it was discarded.
    pub fn fetch(&self, ptr: UndoPtr) -> Option<UndoRecord> {
        if !ptr.is_valid() {
            return None;
        }
        let inner = self.inner.read();
        let counter = ptr.as_u64();
        if counter <= inner.base {
            return None;
        }
        let idx = (counter - inner.base - 1) as usize;
        inner.records.get(idx).cloned()
    }

    /// The oldest retained pointer. Any pointer strictly below this names
    /// a discarded record and the row it sits on is all-visible.
    pub fn oldest_ptr(&self) -> UndoPtr {
        let inner = self.inner.read();
        UndoPtr::new(inner.base + 1)
    }

    /// Discards every record with a pointer below `ptr`.
    pub fn discard_up_to(&self, ptr: UndoPtr) {
        let mut inner = self.inner.write();
        let target = ptr.as_u64().saturating_sub(1);
        while inner.base < target && !inner.records.is_empty() {
            inner.records.pop_front();
            inner.base += 1;
        }
    }

    /// Returns every retained record with its pointer, oldest first.
    ///
    /// Used by the undo-horizon advance during vacuum; the log is trimmed
    /// shortly after, so the clone is short-lived.
    pub fn snapshot_records(&self) -> Vec<(UndoPtr, UndoRecord)> {
        let inner = self.inner.read();
        inner
            .records
            .iter()
            .enumerate()
            .map(|(i, rec)| (UndoPtr::new(inner.base + i as u64 + 1), rec.clone()))
            .collect()
    }

    /// Clears the speculative-insertion token on the Insert record `ptr`
    /// names, confirming the speculative insertion.
    pub fn clear_speculative_token(&self, ptr: UndoPtr) {
        if !ptr.is_valid() {
            return;
        }
        let mut inner = self.inner.write();
        let counter = ptr.as_u64();
        if counter <= inner.base {
            return;
        }
        let idx = (counter - inner.base - 1) as usize;
        if let Some(UndoRecord::Insert {
            speculative_token, ..
        }) = inner.records.get_mut(idx)
        {
            *speculative_token = 0;
        }
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// True when no records are retained.
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_rec(n: u64) -> UndoRecord {
        UndoRecord::Insert {
            xid: TxnId::new(n),
            cid: CommandId::FIRST,
            tid: Tid::new(n),
            endtid: Tid::new(n),
            speculative_token: 0,
            prev: UndoPtr::INVALID,
        }
    }

    #[test]
    fn test_insert_fetch() {
        let log = UndoLog::new();
        let p1 = log.insert(insert_rec(10));
        let p2 = log.insert(insert_rec(11));

        assert!(p1 < p2);
        assert_eq!(log.fetch(p1).unwrap().xid(), TxnId::new(10));
        assert_eq!(log.fetch(p2).unwrap().xid(), TxnId::new(11));
        assert!(log.fetch(UndoPtr::INVALID).is_none());
    }

    #[test]
    fn test_pointers_stable_across_discard() {
        let log = UndoLog::new();
        let p1 = log.insert(insert_rec(1));
        let p2 = log.insert(insert_rec(2));
        let p3 = log.insert(insert_rec(3));

        log.discard_up_to(p3);
        assert!(log.fetch(p1).is_none());
        assert!(log.fetch(p2).is_none());
        assert_eq!(log.fetch(p3).unwrap().xid(), TxnId::new(3));
        assert_eq!(log.oldest_ptr(), p3);
    }

    #[test]
    fn test_oldest_ptr_of_empty() {
        let log = UndoLog::new();
        // Nothing retained; the next record would get this pointer.
        assert_eq!(log.oldest_ptr(), UndoPtr::new(1));
    }

    #[test]
    fn test_with_base_skips_stale_pointers() {
        let log = UndoLog::with_base(100);
        assert_eq!(log.high_water(), 100);
        // Pointers persisted before the restart read as discarded.
        assert!(log.fetch(UndoPtr::new(42)).is_none());
        assert!(UndoPtr::new(42) < log.oldest_ptr());
        // New records start above the old high-water mark.
        let ptr = log.insert(insert_rec(1));
        assert_eq!(ptr, UndoPtr::new(101));
        assert_eq!(log.high_water(), 101);
    }

    #[test]
    fn test_snapshot_records() {
        let log = UndoLog::new();
        let p1 = log.insert(insert_rec(1));
        let p2 = log.insert(insert_rec(2));

        let all = log.snapshot_records();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, p1);
        assert_eq!(all[1].0, p2);
    }

    #[test]
    fn test_clear_speculative_token() {
        let log = UndoLog::new();
        let ptr = log.insert(UndoRecord::Insert {
            xid: TxnId::new(5),
            cid: CommandId::FIRST,
            tid: Tid::MIN,
            endtid: Tid::MIN,
            speculative_token: 42,
            prev: UndoPtr::INVALID,
        });

        log.clear_speculative_token(ptr);
        match log.fetch(ptr).unwrap() {
            UndoRecord::Insert {
                speculative_token, ..
            } => assert_eq!(speculative_token, 0),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_record_accessors() {
        let rec = UndoRecord::Update {
            xid: TxnId::new(9),
            cid: CommandId::new(3),
            tid: Tid::new(77),
            prev: UndoPtr::new(5),
            newtid: Tid::new(78),
            key_update: false,
        };
        assert_eq!(rec.xid(), TxnId::new(9));
        assert_eq!(rec.cid(), CommandId::new(3));
        assert_eq!(rec.tid(), Tid::new(77));
        assert_eq!(rec.prev(), UndoPtr::new(5));
    }
}
