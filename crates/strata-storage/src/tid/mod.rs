//! The TID tree: the authoritative index of live and dead row ids.
//!
//! One per relation (attribute number 0). Leaf items are dense runs of
//! TIDs sharing an undo pointer; the tree answers "which rows exist, and
//! what is their visibility history?". All row mutations enter here:
//! insert allocates TIDs at the right edge, delete/update/lock swap in a
//! single-TID item carrying a fresh undo record, undo application marks
//! runs dead, and vacuum collects and removes them.

mod item;
pub mod scan;

pub use item::{TidArrayItem, TidItemFlags};
pub use scan::TidTreeScan;

use std::collections::BTreeSet;

use strata_common::constants::{DEAD_TID_ENTRY_BYTES, SLOT_SIZE};
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{AttrNumber, CommandId, Tid, TxnId, UndoPtr};

use strata_mvcc::{
    satisfies_update, satisfies_visibility, LockMode, TmResult, UndoRecord,
};

use crate::btree::repack::RepackContext;
use crate::btree::{
    descend, descend_and_lock_exclusive, unlink_page, write_empty_leaf, UnlinkOutcome,
};
use crate::buffer::{Buffer, PageWriteGuard};
use crate::page::{BtreeOpaque, TreePage, TreePageRef};
use crate::rel::Relation;

/// Decoded TID items of one leaf, in slot order.
fn leaf_items(page: &TreePageRef<'_>) -> Vec<TidArrayItem> {
    (0..page.nitems())
        .map(|i| TidArrayItem::decode(page.item(i)))
        .collect()
}

/// Greatest item index whose first TID is `<= tid`.
fn binsrch_tidpage(page: &TreePageRef<'_>, tid: Tid) -> Option<usize> {
    let mut low = 0usize;
    let mut high = page.nitems();
    while high > low {
        let mid = low + (high - low) / 2;
        let item = TidArrayItem::decode(page.item(mid));
        if tid >= item.first {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low.checked_sub(1)
}

/// A located row: the leaf stays exclusively locked until the caller
/// drops (or consumes) the guard.
pub(crate) struct FetchedTid {
    pub buf: Buffer,
    pub guard: PageWriteGuard,
    pub item: TidArrayItem,
}

/// Locates the item covering `tid`, leaving its leaf exclusively locked.
pub(crate) fn fetch(rel: &Relation, tid: Tid) -> StrataResult<Option<FetchedTid>> {
    let (buf, guard) = descend_and_lock_exclusive(rel.pool(), AttrNumber::TID_TREE, tid, 0)?;
    let found = {
        let page = TreePageRef::new(&guard);
        binsrch_tidpage(&page, tid)
            .map(|idx| TidArrayItem::decode(page.item(idx)))
            .filter(|item| item.covers(tid))
    };
    Ok(found.map(|item| FetchedTid { buf, guard, item }))
}

/// Returns the first TID that has never been assigned.
pub fn next_free_tid(rel: &Relation) -> StrataResult<Tid> {
    let Some(buf) = descend(rel.pool(), AttrNumber::TID_TREE, Tid::MAX, 0, true)? else {
        return Ok(Tid::MIN);
    };
    let guard = buf.read();
    let page = TreePageRef::new(&guard);
    let opaque = BtreeOpaque::read_from(&guard);
    Ok(if page.nitems() > 0 {
        TidArrayItem::decode(page.item(page.nitems() - 1)).end()
    } else {
        opaque.lokey
    })
}

/// Allocates `nitems` consecutive TIDs, appending one run item to the
/// rightmost leaf, and emits one INSERT undo record covering the run.
///
/// A frozen `xid` emits no undo record: the rows are born all-visible.
/// `start_hint` may name a pre-chosen starting TID; it must not collide
/// with assigned TIDs.
pub fn multi_insert(
    rel: &Relation,
    nitems: usize,
    start_hint: Option<Tid>,
    xid: TxnId,
    cid: CommandId,
    speculative_token: u32,
    prev_undo: UndoPtr,
) -> StrataResult<Vec<Tid>> {
    if nitems == 0 {
        return Err(StrataError::invalid_argument("multi_insert of zero rows"));
    }

    let (buf, guard) = descend_and_lock_exclusive(rel.pool(), AttrNumber::TID_TREE, Tid::MAX, 0)?;
    let opaque = BtreeOpaque::read_from(&guard);
    let next_unassigned = {
        let page = TreePageRef::new(&guard);
        if page.nitems() > 0 {
            TidArrayItem::decode(page.item(page.nitems() - 1)).end()
        } else {
            opaque.lokey
        }
    };
    let start = match start_hint {
        Some(hint) if hint >= next_unassigned => hint,
        Some(hint) => {
            return Err(StrataError::invalid_argument(format!(
                "requested tid {hint} is already assigned"
            )))
        }
        None => next_unassigned,
    };
    let last = start + (nitems as u64 - 1);
    if !last.is_valid() {
        return Err(StrataError::invalid_argument("tid space exhausted"));
    }

    let undo_ptr = if xid == TxnId::FROZEN {
        UndoPtr::INVALID
    } else {
        rel.undo().insert(UndoRecord::Insert {
            xid,
            cid,
            tid: start,
            endtid: last,
            speculative_token,
            prev: prev_undo,
        })
    };

    let item = TidArrayItem::new(start, nitems as u32, undo_ptr);
    add_items(rel, buf, guard, &[item])?;

    Ok((0..nitems as u64).map(|i| start + i).collect())
}

/// Appends new items (already in key order, past every existing item) to
/// a leaf, repacking when they do not fit in place.
fn add_items(
    rel: &Relation,
    buf: Buffer,
    mut guard: PageWriteGuard,
    newitems: &[TidArrayItem],
) -> StrataResult<()> {
    let need = newitems.len() * (TidArrayItem::ENCODED_SIZE + SLOT_SIZE);
    if TreePageRef::new(&guard).free_space() >= need {
        let mut page = TreePage::new(guard.as_mut_slice());
        let base = page.nitems();
        for (i, item) in newitems.iter().enumerate() {
            let ok = page.insert_item(base + i, &item.encode());
            debug_assert!(ok);
        }
        buf.mark_dirty();
        return Ok(());
    }

    let mut items = leaf_items(&TreePageRef::new(&guard));
    items.extend_from_slice(newitems);
    repack_replace(rel, buf, guard, items)
}

/// Deletes a row: visibility-checks it, emits a DELETE undo record, and
/// replaces its slice of the covering run.
pub fn delete(
    rel: &Relation,
    tid: Tid,
    xid: TxnId,
    cid: CommandId,
    snapshot: &strata_mvcc::Snapshot,
    changing_part: bool,
) -> StrataResult<TmResult> {
    let recent_oldest = rel.undo().oldest_ptr();
    let Some(FetchedTid { buf, guard, item }) = fetch(rel, tid)? else {
        return Err(StrataError::TidNotFound { tid });
    };
    if item.is_dead() {
        return Err(StrataError::TidIsDead { tid });
    }

    let check = satisfies_update(
        rel.undo(),
        rel.txns(),
        snapshot,
        recent_oldest,
        tid,
        item.undo_ptr,
        LockMode::Exclusive,
    );
    if check.result != TmResult::Ok {
        return Ok(check.result);
    }

    let prev = if check.keep_old_undo_ptr {
        item.undo_ptr
    } else {
        UndoPtr::INVALID
    };
    let undo_ptr = rel.undo().insert(UndoRecord::Delete {
        xid,
        cid,
        tid,
        prev,
        changed_part: changing_part,
    });

    replace_item(rel, buf, guard, tid, Some(TidArrayItem::new(tid, 1, undo_ptr)))?;
    Ok(TmResult::Ok)
}

/// Updates a row: locks the old version, inserts the new one at the right
/// edge, then marks the old version updated (pointing at the new TID).
///
/// The leaf lock cannot be held across all three steps (the new version
/// may land on the same leaf), so the last step re-validates visibility.
/// If the old row was modified in the window, the provisionally inserted
/// new TID is marked dead and the failing `TmResult` is returned; the
/// caller may retry.
pub fn update(
    rel: &Relation,
    otid: Tid,
    xid: TxnId,
    cid: CommandId,
    key_update: bool,
    snapshot: &strata_mvcc::Snapshot,
) -> StrataResult<(TmResult, Tid)> {
    let (result, prev_undo) = update_lock_old(rel, otid, key_update, snapshot)?;
    if result != TmResult::Ok {
        return Ok((result, Tid::INVALID));
    }

    let newtid = update_insert_new(rel, xid, cid, prev_undo)?;

    let result = mark_old_updated(rel, otid, newtid, xid, cid, key_update, snapshot)?;
    if result != TmResult::Ok {
        mark_dead(rel, newtid)?;
        return Ok((result, Tid::INVALID));
    }
    Ok((TmResult::Ok, newtid))
}

/// Subroutine of [`update`]: checks that the old row is updatable.
fn update_lock_old(
    rel: &Relation,
    otid: Tid,
    key_update: bool,
    snapshot: &strata_mvcc::Snapshot,
) -> StrataResult<(TmResult, UndoPtr)> {
    let recent_oldest = rel.undo().oldest_ptr();
    let Some(FetchedTid { item, .. }) = fetch(rel, otid)? else {
        return Err(StrataError::TidNotFound { tid: otid });
    };
    if item.is_dead() {
        return Err(StrataError::TidIsDead { tid: otid });
    }
    let mode = if key_update {
        LockMode::Exclusive
    } else {
        LockMode::NoKeyExclusive
    };
    let check = satisfies_update(
        rel.undo(),
        rel.txns(),
        snapshot,
        recent_oldest,
        otid,
        item.undo_ptr,
        mode,
    );
    Ok((check.result, item.undo_ptr))
}

/// Subroutine of [`update`]: inserts the new row version.
fn update_insert_new(
    rel: &Relation,
    xid: TxnId,
    cid: CommandId,
    prev_undo: UndoPtr,
) -> StrataResult<Tid> {
    let tids = multi_insert(rel, 1, None, xid, cid, 0, prev_undo)?;
    Ok(tids[0])
}

/// Subroutine of [`update`]: re-validates the old row and stamps it with
/// an UPDATE undo record carrying the new TID.
fn mark_old_updated(
    rel: &Relation,
    otid: Tid,
    newtid: Tid,
    xid: TxnId,
    cid: CommandId,
    key_update: bool,
    snapshot: &strata_mvcc::Snapshot,
) -> StrataResult<TmResult> {
    let recent_oldest = rel.undo().oldest_ptr();
    let Some(FetchedTid { buf, guard, item }) = fetch(rel, otid)? else {
        return Err(StrataError::TidNotFound { tid: otid });
    };
    if item.is_dead() {
        return Err(StrataError::TidIsDead { tid: otid });
    }

    let mode = if key_update {
        LockMode::Exclusive
    } else {
        LockMode::NoKeyExclusive
    };
    let check = satisfies_update(
        rel.undo(),
        rel.txns(),
        snapshot,
        recent_oldest,
        otid,
        item.undo_ptr,
        mode,
    );
    if check.result != TmResult::Ok {
        return Ok(check.result);
    }

    let prev = if check.keep_old_undo_ptr {
        item.undo_ptr
    } else {
        UndoPtr::INVALID
    };
    let undo_ptr = rel.undo().insert(UndoRecord::Update {
        xid,
        cid,
        tid: otid,
        prev,
        newtid,
        key_update,
    });

    replace_item(rel, buf, guard, otid, Some(TidArrayItem::new(otid, 1, undo_ptr)))?;
    Ok(TmResult::Ok)
}

/// Locks a row: same shape as delete, but the undo record is a
/// `TupleLock` and the row value is unchanged.
pub fn lock_tuple(
    rel: &Relation,
    tid: Tid,
    xid: TxnId,
    cid: CommandId,
    mode: LockMode,
    snapshot: &strata_mvcc::Snapshot,
) -> StrataResult<(TmResult, Option<Tid>)> {
    let recent_oldest = rel.undo().oldest_ptr();
    let Some(FetchedTid { buf, guard, item }) = fetch(rel, tid)? else {
        return Err(StrataError::TidNotFound { tid });
    };
    if item.is_dead() {
        return Err(StrataError::TidIsDead { tid });
    }

    let check = satisfies_update(
        rel.undo(),
        rel.txns(),
        snapshot,
        recent_oldest,
        tid,
        item.undo_ptr,
        mode,
    );
    if check.result != TmResult::Ok {
        return Ok((check.result, check.next_tid));
    }

    let prev = if check.keep_old_undo_ptr {
        item.undo_ptr
    } else {
        UndoPtr::INVALID
    };
    let undo_ptr = rel.undo().insert(UndoRecord::TupleLock {
        xid,
        cid,
        tid,
        prev,
        mode,
    });

    replace_item(rel, buf, guard, tid, Some(TidArrayItem::new(tid, 1, undo_ptr)))?;
    Ok((TmResult::Ok, Some(tid)))
}

/// Marks a row dead (undo application, after its deletion aged out).
/// Idempotent; a missing row only warns.
pub fn mark_dead(rel: &Relation, tid: Tid) -> StrataResult<()> {
    let Some(FetchedTid { buf, guard, item }) = fetch(rel, tid)? else {
        tracing::warn!(%tid, "could not find tuple to mark dead");
        return Ok(());
    };
    if item.is_dead() {
        return Ok(());
    }
    replace_item(rel, buf, guard, tid, Some(TidArrayItem::dead(tid)))
}

/// Clears a row's undo pointer if it still names the given record
/// (undo application, after the deleting transaction aborted). A newer
/// pointer means the deletion was already superseded; nothing to do.
pub fn undo_deletion(rel: &Relation, tid: Tid, undo_ptr: UndoPtr) -> StrataResult<()> {
    let Some(FetchedTid { buf, guard, item }) = fetch(rel, tid)? else {
        tracing::warn!(%tid, "could not find aborted tuple to restore");
        return Ok(());
    };
    if item.undo_ptr == undo_ptr {
        replace_item(
            rel,
            buf,
            guard,
            tid,
            Some(TidArrayItem::new(tid, 1, UndoPtr::INVALID)),
        )
    } else {
        Ok(())
    }
}

/// Confirms a speculative insertion by clearing the token on the row's
/// INSERT undo record.
pub fn clear_speculative_token(rel: &Relation, tid: Tid) -> StrataResult<()> {
    let Some(FetchedTid { item, .. }) = fetch(rel, tid)? else {
        return Err(StrataError::TidNotFound { tid });
    };
    if item.is_dead() {
        return Err(StrataError::TidIsDead { tid });
    }
    rel.undo().clear_speculative_token(item.undo_ptr);
    Ok(())
}

/// Follows the update chain from `tid`, returning the TID of the latest
/// version visible to the snapshot.
pub fn find_latest_tid(
    rel: &Relation,
    tid: Tid,
    snapshot: &strata_mvcc::Snapshot,
) -> StrataResult<Option<Tid>> {
    let recent_oldest = rel.undo().oldest_ptr();
    let mut curr = tid;
    let mut latest = None;

    while curr.is_valid() {
        let Some(fetched) = fetch(rel, curr)? else {
            break;
        };
        if fetched.item.is_dead() {
            break;
        }
        let check = satisfies_visibility(
            rel.undo(),
            rel.txns(),
            snapshot,
            recent_oldest,
            fetched.item.undo_ptr,
        );
        drop(fetched);
        if check.visible {
            latest = Some(curr);
        }
        match check.next_tid {
            Some(next) if next != curr => curr = next,
            _ => break,
        }
    }
    Ok(latest)
}

/// Walks leaves from `starttid`, collecting every dead TID until the
/// memory budget is hit. Returns the set and the TID to resume from
/// (`Tid::MAX_PLUS_ONE` when the whole tree has been scanned).
pub fn collect_dead_tids(
    rel: &Relation,
    starttid: Tid,
    mem_budget: usize,
) -> StrataResult<(BTreeSet<Tid>, Tid)> {
    let mut result = BTreeSet::new();
    let mut nexttid = starttid;
    let mut nextblock = strata_common::types::BlockNumber::INVALID;

    loop {
        let buf = {
            let linked = if nextblock.is_valid() {
                let buf = rel.pool().pin(nextblock)?;
                let expected = {
                    let guard = buf.read();
                    crate::btree::page_is_expected(&guard, AttrNumber::TID_TREE, nexttid, 0)
                };
                expected.then_some(buf)
            } else {
                None
            };
            match linked {
                Some(buf) => buf,
                None => match descend(rel.pool(), AttrNumber::TID_TREE, nexttid, 0, true)? {
                    Some(buf) => buf,
                    None => return Ok((result, Tid::MAX_PLUS_ONE)),
                },
            }
        };

        let guard = buf.read();
        if !crate::btree::page_is_expected(&guard, AttrNumber::TID_TREE, nexttid, 0) {
            // Reshaped between pin and lock; re-descend.
            nextblock = strata_common::types::BlockNumber::INVALID;
            continue;
        }

        let page = TreePageRef::new(&guard);
        for i in 0..page.nitems() {
            let item = TidArrayItem::decode(page.item(i));
            if item.is_dead() {
                for j in 0..item.nelements as u64 {
                    result.insert(item.first + j);
                }
            }
        }

        let opaque = BtreeOpaque::read_from(&guard);
        nexttid = opaque.hikey;
        nextblock = opaque.next;
        drop(guard);

        if nexttid == Tid::MAX_PLUS_ONE {
            return Ok((result, Tid::MAX_PLUS_ONE));
        }
        if result.len() * DEAD_TID_ENTRY_BYTES > mem_budget {
            return Ok((result, nexttid));
        }
    }
}

/// Physically removes the given TIDs, leaf by leaf. Leaves that end up
/// empty are unlinked from the tree.
pub fn remove(rel: &Relation, tids: &BTreeSet<Tid>) -> StrataResult<()> {
    let mut iter = tids.iter().copied();
    let Some(mut nexttid) = iter.next() else {
        return Ok(());
    };

    loop {
        let (buf, guard) =
            descend_and_lock_exclusive(rel.pool(), AttrNumber::TID_TREE, nexttid, 0)?;
        let opaque = BtreeOpaque::read_from(&guard);
        let hikey = opaque.hikey;
        let mut target = Some(nexttid);
        let mut newitems: Vec<TidArrayItem> = Vec::new();

        {
            let page = TreePageRef::new(&guard);
            for i in 0..page.nitems() {
                let item = TidArrayItem::decode(page.item(i));

                // Targets below this run are absent from the tree; skip.
                while let Some(t) = target {
                    if t < item.first {
                        target = iter.next();
                    } else {
                        break;
                    }
                }

                if target.map_or(true, |t| t >= item.end()) {
                    newitems.push(item);
                    continue;
                }

                // Slice the run around the removed TIDs.
                let mut first = item.first;
                let mut remaining = item.nelements as u64;
                while remaining > 0 {
                    while remaining > 0 && target == Some(first) {
                        first = first.next();
                        remaining -= 1;
                        target = iter.next();
                    }
                    if remaining > 0 {
                        let slice_end = match target {
                            Some(t) if t < first + remaining => t,
                            _ => first + remaining,
                        };
                        let count = slice_end - first;
                        newitems.push(TidArrayItem {
                            first,
                            nelements: count as u32,
                            undo_ptr: item.undo_ptr,
                            flags: item.flags,
                        });
                        first = first + count;
                        remaining -= count;
                    }
                }
            }
        }

        // Skip any leftover targets that fall in this page's range but
        // were not present.
        while let Some(t) = target {
            if t < hikey {
                target = iter.next();
            } else {
                break;
            }
        }

        if newitems.is_empty() {
            match unlink_page(rel.pool(), AttrNumber::TID_TREE, &buf, guard, 0)? {
                UnlinkOutcome::Unlinked(stack) => stack.apply(rel.pool()),
                UnlinkOutcome::Declined(guard) => write_empty_leaf(&buf, guard),
            }
        } else {
            repack_replace(rel, buf, guard, newitems)?;
        }

        match target {
            Some(t) => nexttid = t,
            None => break,
        }
    }
    Ok(())
}

/// Replaces the single TID `oldtid` within its covering run.
///
/// The run is sliced into up to three pieces (before, replacement,
/// after); when the extra items fit on the page the swap happens in
/// place, otherwise the whole leaf goes through the repacker.
fn replace_item(
    rel: &Relation,
    buf: Buffer,
    mut guard: PageWriteGuard,
    oldtid: Tid,
    replacement: Option<TidArrayItem>,
) -> StrataResult<()> {
    debug_assert!(replacement.map_or(true, |r| r.first == oldtid && r.nelements == 1));

    let (idx, old) = {
        let page = TreePageRef::new(&guard);
        let idx = binsrch_tidpage(&page, oldtid).ok_or_else(|| {
            StrataError::internal(format!("could not find item to replace for tid {oldtid}"))
        })?;
        (idx, TidArrayItem::decode(page.item(idx)))
    };
    if !old.covers(oldtid) {
        return Err(StrataError::internal(format!(
            "could not find item to replace for tid {oldtid}"
        )));
    }

    let cutoff = oldtid - old.first;
    let mut slices: Vec<TidArrayItem> = Vec::with_capacity(3);
    if cutoff > 0 {
        slices.push(TidArrayItem {
            first: old.first,
            nelements: cutoff as u32,
            undo_ptr: old.undo_ptr,
            flags: old.flags,
        });
    }
    if let Some(replacement) = replacement {
        slices.push(replacement);
    }
    if cutoff + 1 < old.nelements as u64 {
        slices.push(TidArrayItem {
            first: oldtid.next(),
            nelements: (old.nelements as u64 - cutoff - 1) as u32,
            undo_ptr: old.undo_ptr,
            flags: old.flags,
        });
    }

    // The removed item's bytes stay dead on the page, so the in-place
    // check only counts what gets written.
    let need = slices.len() * (TidArrayItem::ENCODED_SIZE + SLOT_SIZE);
    if TreePageRef::new(&guard).free_space() >= need {
        let mut page = TreePage::new(guard.as_mut_slice());
        page.remove_item(idx);
        for (i, slice) in slices.iter().enumerate() {
            let ok = page.insert_item(idx + i, &slice.encode());
            debug_assert!(ok);
        }
        buf.mark_dirty();
        return Ok(());
    }

    let mut items: Vec<TidArrayItem> = Vec::new();
    {
        let page = TreePageRef::new(&guard);
        for i in 0..page.nitems() {
            if i == idx {
                items.extend(slices.iter().copied());
            } else {
                items.push(TidArrayItem::decode(page.item(i)));
            }
        }
    }
    if items.is_empty() {
        match unlink_page(rel.pool(), AttrNumber::TID_TREE, &buf, guard, 0)? {
            UnlinkOutcome::Unlinked(stack) => stack.apply(rel.pool()),
            UnlinkOutcome::Declined(guard) => write_empty_leaf(&buf, guard),
        }
        return Ok(());
    }
    repack_replace(rel, buf, guard, items)
}

/// Rewrites a leaf with `items` as its new content, splitting as needed.
fn repack_replace(
    rel: &Relation,
    buf: Buffer,
    guard: PageWriteGuard,
    items: Vec<TidArrayItem>,
) -> StrataResult<()> {
    debug_assert!(!items.is_empty());
    debug_assert!(items.windows(2).all(|w| w[0].end() <= w[1].first));

    let opaque = BtreeOpaque::read_from(&guard);
    let total = items.len() * (TidArrayItem::ENCODED_SIZE + SLOT_SIZE);
    let mut cxt = RepackContext::new(
        AttrNumber::TID_TREE,
        0,
        opaque.lokey,
        opaque.hikey,
        opaque.is_root(),
        total,
    );
    for item in &items {
        cxt.add_item(item.first, &item.encode())?;
    }
    let stack = cxt.finish(rel.pool(), buf, guard, opaque.next)?;
    stack.apply(rel.pool());
    Ok(())
}
