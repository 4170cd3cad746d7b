//! Visibility checks over undo chains.
//!
//! A row item stores the pointer to the newest undo record affecting it.
//! Deciding visibility means walking the chain from that record towards
//! older ones until the question is settled. Two entry points exist:
//!
//! - [`satisfies_visibility`]: is the row visible to a snapshot? (scans)
//! - [`satisfies_update`]: may a transaction modify the row, and should
//!   the new undo record chain onto the old one? (delete/update/lock)
//!
//! Both treat a pointer older than the caller's cached oldest-undo pointer
//! as "history discarded, row all-visible". Callers read that pointer once
//! per scan; a stale value merely causes a spurious chain walk.

use strata_common::types::{Tid, TxnId, UndoPtr};

use crate::snapshot::Snapshot;
use crate::undo::{LockMode, UndoLog, UndoRecord};
use crate::xact::{TransactionManager, XactStatus};

/// Outcome of a modification attempt, in the manner of the table-AM
/// `TM_Result` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmResult {
    /// The row may be modified.
    Ok,
    /// The row is not visible to the caller's snapshot.
    Invisible,
    /// The caller's own transaction already modified the row.
    SelfModified,
    /// A committed concurrent transaction deleted or updated the row.
    Updated,
    /// An in-progress transaction holds the row.
    BeingModified,
}

/// Result of [`satisfies_visibility`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityCheck {
    /// Whether the row is visible to the snapshot.
    pub visible: bool,
    /// When invisibility was caused by a concurrent (not aborted)
    /// transaction, that transaction's id. Serializable readers report a
    /// conflict-out against it when they skip the row.
    pub obsoleting_xid: Option<TxnId>,
    /// TID of the row's successor version, when an update record was seen.
    pub next_tid: Option<Tid>,
}

impl VisibilityCheck {
    fn visible(next_tid: Option<Tid>) -> Self {
        Self {
            visible: true,
            obsoleting_xid: None,
            next_tid,
        }
    }

    fn invisible(obsoleting_xid: Option<TxnId>, next_tid: Option<Tid>) -> Self {
        Self {
            visible: false,
            obsoleting_xid,
            next_tid,
        }
    }
}

/// Result of [`satisfies_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCheck {
    /// Whether the modification may proceed.
    pub result: TmResult,
    /// Whether the new undo record should chain onto the existing one.
    /// False once the old record has aged out of the undo horizon.
    pub keep_old_undo_ptr: bool,
    /// Where the row went, for `Updated` outcomes.
    pub next_tid: Option<Tid>,
}

/// Decides whether the row behind `ptr` is visible to `snapshot`.
pub fn satisfies_visibility(
    undo: &UndoLog,
    txns: &TransactionManager,
    snapshot: &Snapshot,
    recent_oldest: UndoPtr,
    ptr: UndoPtr,
) -> VisibilityCheck {
    let mut cur = ptr;
    let mut next_tid = None;

    loop {
        if !cur.is_valid() || cur < recent_oldest {
            return VisibilityCheck::visible(next_tid);
        }
        let Some(rec) = undo.fetch(cur) else {
            // Discarded under us; everything at or below it is all-visible.
            return VisibilityCheck::visible(next_tid);
        };

        match rec {
            UndoRecord::Insert { xid, .. } => {
                // Bottom of the chain: the row exists iff the insert is
                // visible.
                return if snapshot.sees_xid(xid, txns) {
                    VisibilityCheck::visible(next_tid)
                } else {
                    let concurrent = matches!(
                        txns.status(xid),
                        XactStatus::Committed | XactStatus::InProgress
                    );
                    VisibilityCheck::invisible(concurrent.then_some(xid), next_tid)
                };
            }

            UndoRecord::Delete { xid, prev, .. } => {
                if xid == snapshot.owner() {
                    // We deleted it ourselves.
                    return VisibilityCheck::invisible(None, next_tid);
                }
                match txns.status(xid) {
                    // Rolled back, or not yet decided for us: the delete
                    // does not count; keep walking to the insert.
                    XactStatus::Aborted | XactStatus::InProgress => cur = prev,
                    XactStatus::Committed => {
                        if snapshot.sees_xid(xid, txns) {
                            return VisibilityCheck::invisible(None, next_tid);
                        }
                        // Committed after our snapshot: we see the
                        // pre-delete version.
                        cur = prev;
                    }
                }
            }

            UndoRecord::Update {
                xid, prev, newtid, ..
            } => {
                if txns.status(xid) != XactStatus::Aborted {
                    next_tid = Some(newtid);
                }
                if xid == snapshot.owner() {
                    return VisibilityCheck::invisible(None, next_tid);
                }
                match txns.status(xid) {
                    XactStatus::Aborted | XactStatus::InProgress => cur = prev,
                    XactStatus::Committed => {
                        if snapshot.sees_xid(xid, txns) {
                            return VisibilityCheck::invisible(None, next_tid);
                        }
                        cur = prev;
                    }
                }
            }

            UndoRecord::TupleLock { prev, .. } => {
                // Locks never affect visibility.
                cur = prev;
            }
        }
    }
}

/// True when a held row lock blocks a request of the given strength.
fn lock_modes_conflict(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match (held, requested) {
        (Exclusive, _) | (_, Exclusive) => true,
        (KeyShare, _) | (_, KeyShare) => false,
        (Share, Share) => false,
        (Share, NoKeyExclusive) | (NoKeyExclusive, _) => true,
    }
}

/// Decides whether `snapshot`'s owner may modify the row at `tid` whose
/// item carries `ptr`, with the given lock strength.
pub fn satisfies_update(
    undo: &UndoLog,
    txns: &TransactionManager,
    snapshot: &Snapshot,
    recent_oldest: UndoPtr,
    tid: Tid,
    ptr: UndoPtr,
    mode: LockMode,
) -> UpdateCheck {
    // The old record is worth chaining onto only while it is still inside
    // the undo horizon.
    let keep_old_undo_ptr = ptr.is_valid() && ptr >= recent_oldest;
    let done = |result: TmResult, next_tid: Option<Tid>| UpdateCheck {
        result,
        keep_old_undo_ptr,
        next_tid,
    };

    let mut cur = ptr;
    loop {
        if !cur.is_valid() || cur < recent_oldest {
            return done(TmResult::Ok, None);
        }
        let Some(rec) = undo.fetch(cur) else {
            return done(TmResult::Ok, None);
        };

        match rec {
            UndoRecord::Insert { xid, .. } => {
                if xid == snapshot.owner() {
                    return done(TmResult::Ok, None);
                }
                return match txns.status(xid) {
                    XactStatus::InProgress => done(TmResult::BeingModified, None),
                    XactStatus::Aborted => done(TmResult::Invisible, None),
                    XactStatus::Committed => {
                        if snapshot.sees_xid(xid, txns) {
                            done(TmResult::Ok, None)
                        } else {
                            done(TmResult::Invisible, None)
                        }
                    }
                };
            }

            UndoRecord::Delete { xid, prev, .. } => {
                if xid == snapshot.owner() {
                    return done(TmResult::SelfModified, Some(tid));
                }
                match txns.status(xid) {
                    XactStatus::InProgress => return done(TmResult::BeingModified, None),
                    XactStatus::Committed => return done(TmResult::Updated, Some(tid)),
                    XactStatus::Aborted => cur = prev,
                }
            }

            UndoRecord::Update {
                xid, prev, newtid, ..
            } => {
                if xid == snapshot.owner() {
                    return done(TmResult::SelfModified, Some(newtid));
                }
                match txns.status(xid) {
                    XactStatus::InProgress => return done(TmResult::BeingModified, None),
                    XactStatus::Committed => return done(TmResult::Updated, Some(newtid)),
                    XactStatus::Aborted => cur = prev,
                }
            }

            UndoRecord::TupleLock {
                xid,
                prev,
                mode: held,
                ..
            } => {
                if xid != snapshot.owner()
                    && txns.status(xid) == XactStatus::InProgress
                    && lock_modes_conflict(held, mode)
                {
                    return done(TmResult::BeingModified, None);
                }
                cur = prev;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::types::CommandId;

    fn setup() -> (UndoLog, TransactionManager) {
        (UndoLog::new(), TransactionManager::new())
    }

    fn insert_rec(xid: TxnId, tid: Tid) -> UndoRecord {
        UndoRecord::Insert {
            xid,
            cid: CommandId::FIRST,
            tid,
            endtid: tid,
            speculative_token: 0,
            prev: UndoPtr::INVALID,
        }
    }

    #[test]
    fn test_invalid_ptr_all_visible() {
        let (undo, txns) = setup();
        let snap = txns.snapshot_now();
        let check =
            satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), UndoPtr::INVALID);
        assert!(check.visible);
    }

    #[test]
    fn test_committed_insert_visible() {
        let (undo, txns) = setup();
        let writer = txns.begin();
        let ptr = undo.insert(insert_rec(writer.xid(), Tid::MIN));
        txns.commit(writer.xid()).unwrap();

        let snap = txns.snapshot_now();
        let check = satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), ptr);
        assert!(check.visible);
    }

    #[test]
    fn test_concurrent_insert_invisible_with_obsoleting() {
        let (undo, txns) = setup();
        let reader = txns.begin();
        let writer = txns.begin();
        let ptr = undo.insert(insert_rec(writer.xid(), Tid::MIN));
        txns.commit(writer.xid()).unwrap();

        let check =
            satisfies_visibility(&undo, &txns, reader.snapshot(), undo.oldest_ptr(), ptr);
        assert!(!check.visible);
        assert_eq!(check.obsoleting_xid, Some(writer.xid()));
    }

    #[test]
    fn test_aborted_insert_invisible_no_obsoleting() {
        let (undo, txns) = setup();
        let writer = txns.begin();
        let ptr = undo.insert(insert_rec(writer.xid(), Tid::MIN));
        txns.abort(writer.xid()).unwrap();

        let snap = txns.snapshot_now();
        let check = satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), ptr);
        assert!(!check.visible);
        assert_eq!(check.obsoleting_xid, None);
    }

    #[test]
    fn test_visible_delete_hides_row() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::MIN));
        txns.commit(inserter.xid()).unwrap();

        let deleter = txns.begin();
        let delete_ptr = undo.insert(UndoRecord::Delete {
            xid: deleter.xid(),
            cid: CommandId::FIRST,
            tid: Tid::MIN,
            prev: insert_ptr,
            changed_part: false,
        });
        txns.commit(deleter.xid()).unwrap();

        let snap = txns.snapshot_now();
        let check = satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), delete_ptr);
        assert!(!check.visible);
    }

    #[test]
    fn test_pending_delete_row_still_visible() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::MIN));
        txns.commit(inserter.xid()).unwrap();

        let deleter = txns.begin();
        let delete_ptr = undo.insert(UndoRecord::Delete {
            xid: deleter.xid(),
            cid: CommandId::FIRST,
            tid: Tid::MIN,
            prev: insert_ptr,
            changed_part: false,
        });
        // Deleter has not committed; other snapshots still see the row.
        let snap = txns.snapshot_now();
        let check = satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), delete_ptr);
        assert!(check.visible);
        drop(deleter);
    }

    #[test]
    fn test_aborted_delete_row_visible() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::MIN));
        txns.commit(inserter.xid()).unwrap();

        let deleter = txns.begin();
        let delete_ptr = undo.insert(UndoRecord::Delete {
            xid: deleter.xid(),
            cid: CommandId::FIRST,
            tid: Tid::MIN,
            prev: insert_ptr,
            changed_part: false,
        });
        txns.abort(deleter.xid()).unwrap();

        let snap = txns.snapshot_now();
        let check = satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), delete_ptr);
        assert!(check.visible);
    }

    #[test]
    fn test_update_chain_reports_next_tid() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::new(5)));
        txns.commit(inserter.xid()).unwrap();

        let updater = txns.begin();
        let update_ptr = undo.insert(UndoRecord::Update {
            xid: updater.xid(),
            cid: CommandId::FIRST,
            tid: Tid::new(5),
            prev: insert_ptr,
            newtid: Tid::new(6),
            key_update: false,
        });
        txns.commit(updater.xid()).unwrap();

        let snap = txns.snapshot_now();
        let check = satisfies_visibility(&undo, &txns, &snap, undo.oldest_ptr(), update_ptr);
        assert!(!check.visible);
        assert_eq!(check.next_tid, Some(Tid::new(6)));
    }

    #[test]
    fn test_update_check_ok_on_committed_visible_insert() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let ptr = undo.insert(insert_rec(inserter.xid(), Tid::MIN));
        txns.commit(inserter.xid()).unwrap();

        let writer = txns.begin();
        let check = satisfies_update(
            &undo,
            &txns,
            writer.snapshot(),
            undo.oldest_ptr(),
            Tid::MIN,
            ptr,
            LockMode::Exclusive,
        );
        assert_eq!(check.result, TmResult::Ok);
        assert!(check.keep_old_undo_ptr);
    }

    #[test]
    fn test_update_check_being_modified() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::MIN));
        txns.commit(inserter.xid()).unwrap();

        let holder = txns.begin();
        let delete_ptr = undo.insert(UndoRecord::Delete {
            xid: holder.xid(),
            cid: CommandId::FIRST,
            tid: Tid::MIN,
            prev: insert_ptr,
            changed_part: false,
        });

        let contender = txns.begin();
        let check = satisfies_update(
            &undo,
            &txns,
            contender.snapshot(),
            undo.oldest_ptr(),
            Tid::MIN,
            delete_ptr,
            LockMode::Exclusive,
        );
        assert_eq!(check.result, TmResult::BeingModified);
    }

    #[test]
    fn test_update_check_updated_with_next_tid() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::new(5)));
        txns.commit(inserter.xid()).unwrap();

        let contender = txns.begin();

        let updater = txns.begin();
        let update_ptr = undo.insert(UndoRecord::Update {
            xid: updater.xid(),
            cid: CommandId::FIRST,
            tid: Tid::new(5),
            prev: insert_ptr,
            newtid: Tid::new(9),
            key_update: false,
        });
        txns.commit(updater.xid()).unwrap();

        let check = satisfies_update(
            &undo,
            &txns,
            contender.snapshot(),
            undo.oldest_ptr(),
            Tid::new(5),
            update_ptr,
            LockMode::Exclusive,
        );
        assert_eq!(check.result, TmResult::Updated);
        assert_eq!(check.next_tid, Some(Tid::new(9)));
    }

    #[test]
    fn test_update_check_self_modified() {
        let (undo, txns) = setup();
        let me = txns.begin();
        let insert_ptr = undo.insert(insert_rec(me.xid(), Tid::MIN));
        let delete_ptr = undo.insert(UndoRecord::Delete {
            xid: me.xid(),
            cid: CommandId::new(1),
            tid: Tid::MIN,
            prev: insert_ptr,
            changed_part: false,
        });

        let check = satisfies_update(
            &undo,
            &txns,
            me.snapshot(),
            undo.oldest_ptr(),
            Tid::MIN,
            delete_ptr,
            LockMode::Exclusive,
        );
        assert_eq!(check.result, TmResult::SelfModified);
    }

    #[test]
    fn test_shared_locks_do_not_conflict() {
        let (undo, txns) = setup();
        let inserter = txns.begin();
        let insert_ptr = undo.insert(insert_rec(inserter.xid(), Tid::MIN));
        txns.commit(inserter.xid()).unwrap();

        let locker = txns.begin();
        let lock_ptr = undo.insert(UndoRecord::TupleLock {
            xid: locker.xid(),
            cid: CommandId::FIRST,
            tid: Tid::MIN,
            prev: insert_ptr,
            mode: LockMode::Share,
        });

        let reader = txns.begin();
        let share = satisfies_update(
            &undo,
            &txns,
            reader.snapshot(),
            undo.oldest_ptr(),
            Tid::MIN,
            lock_ptr,
            LockMode::Share,
        );
        assert_eq!(share.result, TmResult::Ok);

        let exclusive = satisfies_update(
            &undo,
            &txns,
            reader.snapshot(),
            undo.oldest_ptr(),
            Tid::MIN,
            lock_ptr,
            LockMode::Exclusive,
        );
        assert_eq!(exclusive.result, TmResult::BeingModified);
    }

    #[test]
    fn test_aged_out_ptr_is_ok_and_unchained() {
        let (undo, txns) = setup();
        let writer = txns.begin();
        let ptr = undo.insert(insert_rec(writer.xid(), Tid::MIN));
        txns.commit(writer.xid()).unwrap();
        undo.discard_up_to(ptr.next());

        let me = txns.begin();
        let check = satisfies_update(
            &undo,
            &txns,
            me.snapshot(),
            undo.oldest_ptr(),
            Tid::MIN,
            ptr,
            LockMode::Exclusive,
        );
        assert_eq!(check.result, TmResult::Ok);
        assert!(!check.keep_old_undo_ptr);
    }
}
