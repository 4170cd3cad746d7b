//! TID-tree scan cursor: visible TIDs in ascending order.
//!
//! The cursor keeps a pin (but no lock) on the last leaf it read, takes a
//! share lock only while scanning the page, and caches the current
//! visible run so TIDs are handed out without touching the page again.
//! Concurrent splits are survived by re-checking the page and following
//! right-links; anything worse falls back to a fresh descent.

use strata_common::types::{AttrNumber, BlockNumber, Tid, UndoPtr};
use strata_mvcc::{satisfies_visibility, Snapshot};

use strata_common::error::StrataResult;

use crate::btree::{descend, page_is_expected};
use crate::buffer::Buffer;
use crate::page::{BtreeOpaque, TreePageRef};
use crate::rel::Relation;

use super::TidArrayItem;

/// A scan over the TID tree in `[starttid, endtid)`.
pub struct TidTreeScan<'a> {
    rel: &'a Relation,
    snapshot: Snapshot,
    nexttid: Tid,
    endtid: Tid,
    lastbuf: Option<Buffer>,
    active: bool,
    /// Oldest undo pointer, read once per scan. A stale value only causes
    /// spurious chain walks, never wrong answers.
    recent_oldest_undo: UndoPtr,
    // Cached visible run.
    array_first: Tid,
    array_num: u64,
    array_next: u64,
}

impl<'a> TidTreeScan<'a> {
    /// Opens a scan of `[starttid, endtid)` under the given snapshot.
    pub fn begin(
        rel: &'a Relation,
        snapshot: &Snapshot,
        starttid: Tid,
        endtid: Tid,
    ) -> Self {
        Self {
            rel,
            snapshot: snapshot.clone(),
            nexttid: starttid,
            endtid,
            lastbuf: None,
            active: true,
            recent_oldest_undo: rel.undo().oldest_ptr(),
            array_first: Tid::INVALID,
            array_num: 0,
            array_next: 0,
        }
    }

    /// Returns the next visible TID, or `None` at the end of the range.
    pub fn next(&mut self) -> StrataResult<Option<Tid>> {
        if !self.active {
            return Ok(None);
        }
        loop {
            if self.array_next < self.array_num {
                let tid = self.array_first + self.array_next;
                self.array_next += 1;
                self.nexttid = tid.next();
                return Ok(Some(tid));
            }
            if self.nexttid >= self.endtid || !self.load_next_run()? {
                self.finish();
                return Ok(None);
            }
        }
    }

    /// Resets the cursor to `starttid`. Rewinding drops every cache;
    /// skipping forward keeps them when possible.
    pub fn reset(&mut self, starttid: Tid) {
        if starttid < self.nexttid {
            self.array_num = 0;
            self.array_next = 0;
            self.nexttid = starttid;
            self.lastbuf = None;
            self.active = true;
        } else if self.array_first <= starttid
            && starttid < self.array_first + self.array_num
        {
            self.array_next = starttid - self.array_first;
            self.nexttid = starttid;
        } else {
            self.array_num = 0;
            self.array_next = 0;
            self.nexttid = starttid;
        }
    }

    fn finish(&mut self) {
        self.active = false;
        self.array_num = 0;
        self.array_next = 0;
        self.lastbuf = None;
    }

    /// Caches the slice of a visible run that falls in the scan range.
    fn extract_run(&mut self, item: &TidArrayItem) {
        let mut first = item.first;
        let mut count = item.nelements as u64;
        while first < self.nexttid && count > 0 {
            first = first.next();
            count -= 1;
        }
        if first + count > self.endtid {
            count = self.endtid - first;
        }
        self.array_first = first;
        self.array_num = count;
        self.array_next = 0;
        if self.nexttid < first {
            self.nexttid = first;
        }
    }

    /// Advances to the next visible run at or after `nexttid`, walking
    /// right as needed. Returns false when the range is exhausted.
    fn load_next_run(&mut self) -> StrataResult<bool> {
        loop {
            if self.nexttid >= self.endtid {
                return Ok(false);
            }

            let buf = match self.lastbuf.take() {
                Some(buf) => buf,
                None => {
                    match descend(self.rel.pool(), AttrNumber::TID_TREE, self.nexttid, 0, true)? {
                        Some(buf) => buf,
                        None => return Ok(false),
                    }
                }
            };

            let guard = buf.read();
            if !page_is_expected(&guard, AttrNumber::TID_TREE, self.nexttid, 0) {
                // The page was reshaped since we last saw it. If it still
                // covers the previous TID, its right-link leads onward;
                // otherwise re-descend from the root.
                let prev = self.nexttid.prev();
                if prev.is_valid()
                    && page_is_expected(&guard, AttrNumber::TID_TREE, prev, 0)
                {
                    let next = BtreeOpaque::read_from(&guard).next;
                    drop(guard);
                    if next.is_valid() {
                        self.lastbuf = Some(self.rel.pool().pin(next)?);
                        continue;
                    }
                }
                continue;
            }

            let opaque = BtreeOpaque::read_from(&guard);
            let nitems = TreePageRef::new(&guard).nitems();
            let mut loaded = false;
            for i in 0..nitems {
                let item = TidArrayItem::decode(TreePageRef::new(&guard).item(i));
                if self.nexttid > item.last() {
                    continue;
                }
                if item.first >= self.endtid {
                    self.nexttid = self.endtid;
                    break;
                }

                let visible = if item.is_dead() {
                    false
                } else {
                    let check = satisfies_visibility(
                        self.rel.undo(),
                        self.rel.txns(),
                        &self.snapshot,
                        self.recent_oldest_undo,
                        item.undo_ptr,
                    );
                    if !check.visible && self.snapshot.is_serializable() {
                        if let Some(xid) = check.obsoleting_xid {
                            self.rel
                                .txns()
                                .report_conflict_out(self.snapshot.owner(), xid);
                        }
                    }
                    check.visible
                };

                if !visible {
                    self.nexttid = item.last().next();
                    continue;
                }

                self.extract_run(&item);
                if self.array_num > 0 {
                    loaded = true;
                    break;
                }
            }
            if loaded {
                drop(guard);
                self.lastbuf = Some(buf);
                return Ok(true);
            }

            // Page exhausted: walk right.
            if self.nexttid < opaque.hikey {
                self.nexttid = opaque.hikey;
            }
            let next = opaque.next;
            drop(guard);
            if !next.is_valid() || self.nexttid >= self.endtid {
                return Ok(false);
            }
            debug_assert_ne!(next, buf.block());
            self.lastbuf = Some(self.rel.pool().pin(next)?);
        }
    }
}

impl std::fmt::Debug for TidTreeScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TidTreeScan")
            .field("nexttid", &self.nexttid)
            .field("endtid", &self.endtid)
            .field("active", &self.active)
            .field(
                "lastbuf",
                &self.lastbuf.as_ref().map(|b| b.block()).unwrap_or(BlockNumber::INVALID),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rel::Relation;
    use crate::table::ColumnMeta;
    use crate::tid;
    use strata_common::types::CommandId;
    use strata_common::EngineConfig;

    fn test_rel() -> Relation {
        Relation::create(vec![ColumnMeta::new("c1")], EngineConfig::default()).unwrap()
    }

    fn collect(scan: &mut TidTreeScan<'_>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(tid) = scan.next().unwrap() {
            out.push(tid.as_u64());
        }
        out
    }

    #[test]
    fn test_empty_tree_scan() {
        let rel = test_rel();
        let snapshot = rel.transactions().snapshot_now();
        let mut scan = TidTreeScan::begin(&rel, &snapshot, Tid::MIN, Tid::MAX_PLUS_ONE);
        assert_eq!(scan.next().unwrap(), None);
        // Idle afterwards.
        assert_eq!(scan.next().unwrap(), None);
    }

    #[test]
    fn test_scan_returns_committed_in_order() {
        let rel = test_rel();
        let txn = rel.transactions().begin();
        tid::multi_insert(
            &rel,
            10,
            None,
            txn.xid(),
            txn.next_command(),
            0,
            UndoPtr::INVALID,
        )
        .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = TidTreeScan::begin(&rel, &snapshot, Tid::MIN, Tid::MAX_PLUS_ONE);
        assert_eq!(collect(&mut scan), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_scan_skips_uncommitted_and_own() {
        let rel = test_rel();
        let committed = rel.transactions().begin();
        tid::multi_insert(
            &rel,
            2,
            None,
            committed.xid(),
            committed.next_command(),
            0,
            UndoPtr::INVALID,
        )
        .unwrap();
        rel.transactions().commit(committed.xid()).unwrap();

        let pending = rel.transactions().begin();
        tid::multi_insert(
            &rel,
            2,
            None,
            pending.xid(),
            pending.next_command(),
            0,
            UndoPtr::INVALID,
        )
        .unwrap();

        // A standalone snapshot sees only the committed rows.
        let snapshot = rel.transactions().snapshot_now();
        let mut scan = TidTreeScan::begin(&rel, &snapshot, Tid::MIN, Tid::MAX_PLUS_ONE);
        assert_eq!(collect(&mut scan), vec![1, 2]);

        // The pending transaction sees its own rows too.
        let mut scan =
            TidTreeScan::begin(&rel, pending.snapshot(), Tid::MIN, Tid::MAX_PLUS_ONE);
        assert_eq!(collect(&mut scan), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_scan_range_bounds() {
        let rel = test_rel();
        let txn = rel.transactions().begin();
        tid::multi_insert(
            &rel,
            10,
            None,
            txn.xid(),
            txn.next_command(),
            0,
            UndoPtr::INVALID,
        )
        .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = TidTreeScan::begin(&rel, &snapshot, Tid::new(4), Tid::new(8));
        assert_eq!(collect(&mut scan), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_scan_skips_dead() {
        let rel = test_rel();
        let tids = tid::multi_insert(
            &rel,
            5,
            None,
            strata_common::types::TxnId::FROZEN,
            CommandId::FIRST,
            0,
            UndoPtr::INVALID,
        )
        .unwrap();
        tid::mark_dead(&rel, tids[2]).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = TidTreeScan::begin(&rel, &snapshot, Tid::MIN, Tid::MAX_PLUS_ONE);
        assert_eq!(collect(&mut scan), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_reset_rewind_and_skip() {
        let rel = test_rel();
        let txn = rel.transactions().begin();
        tid::multi_insert(
            &rel,
            6,
            None,
            txn.xid(),
            txn.next_command(),
            0,
            UndoPtr::INVALID,
        )
        .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = TidTreeScan::begin(&rel, &snapshot, Tid::MIN, Tid::MAX_PLUS_ONE);
        assert_eq!(scan.next().unwrap(), Some(Tid::new(1)));
        assert_eq!(scan.next().unwrap(), Some(Tid::new(2)));

        // Skip forward within the cached run.
        scan.reset(Tid::new(5));
        assert_eq!(scan.next().unwrap(), Some(Tid::new(5)));

        // Rewind to the start.
        scan.reset(Tid::MIN);
        assert_eq!(scan.next().unwrap(), Some(Tid::new(1)));
    }
}
