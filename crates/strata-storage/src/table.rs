//! Row-level access-method surface.
//!
//! Ties the TID tree and the attribute trees together into table
//! operations: insert, multi-insert, delete, update, lock, fetch,
//! snapshot scan, and vacuum. The executor-side contract is columnar:
//! a table scan pulls the next visible TID from the TID tree, then asks
//! each attribute scan for that TID's value; attribute scans advance
//! lazily and never rewind within a call.

use bytes::Bytes;

use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{AttrNumber, Tid, UndoPtr};
use strata_mvcc::{
    satisfies_visibility, LockMode, Snapshot, TmResult, Transaction, UndoRecord, XactStatus,
};

use crate::attr::{self, AttrTreeScan};
use crate::rel::Relation;
use crate::tid::{self, TidTreeScan};

/// Metadata for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
}

impl ColumnMeta {
    /// Creates column metadata.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A row: one optional datum per column, `None` meaning NULL.
pub type Row = Vec<Option<Bytes>>;

/// Counters reported by [`Relation::vacuum`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VacuumStats {
    /// Dead TIDs physically removed.
    pub removed_tids: u64,
    /// Collection rounds run (more than one when the dead-TID set hits
    /// the memory budget).
    pub rounds: u32,
}

/// A snapshot scan over a relation: the TID-tree cursor plus one
/// attribute cursor per column, advanced in lockstep.
pub struct TableScan<'a> {
    tid_scan: TidTreeScan<'a>,
    attr_scans: Vec<AttrTreeScan<'a>>,
}

impl<'a> TableScan<'a> {
    /// Returns the next visible row, or `None` at the end.
    pub fn next_row(&mut self) -> StrataResult<Option<(Tid, Row)>> {
        let Some(tid) = self.tid_scan.next()? else {
            return Ok(None);
        };
        let mut row = Vec::with_capacity(self.attr_scans.len());
        for scan in &mut self.attr_scans {
            row.push(scan.fetch(tid)?);
        }
        Ok(Some((tid, row)))
    }

    /// Repositions the scan at `starttid`.
    pub fn reset(&mut self, starttid: Tid) {
        self.tid_scan.reset(starttid);
        for scan in &mut self.attr_scans {
            scan.reset(starttid);
        }
    }
}

impl std::fmt::Debug for TableScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableScan")
            .field("tid_scan", &self.tid_scan)
            .field("columns", &self.attr_scans.len())
            .finish()
    }
}

impl Relation {
    fn check_row_width(&self, row: &[Option<Bytes>]) -> StrataResult<()> {
        if row.len() != self.natts() {
            return Err(StrataError::invalid_argument(format!(
                "row has {} values, relation has {} columns",
                row.len(),
                self.natts()
            )));
        }
        Ok(())
    }

    /// Inserts one row, returning its TID.
    pub fn insert_row(&self, txn: &Transaction, row: &[Option<Bytes>]) -> StrataResult<Tid> {
        self.check_row_width(row)?;
        let cid = txn.next_command();
        let tids = tid::multi_insert(self, 1, None, txn.xid(), cid, 0, UndoPtr::INVALID)?;
        let tid = tids[0];
        for (i, cell) in row.iter().enumerate() {
            let attno = AttrNumber::new(i as u16 + 1);
            let datum = cell.clone().unwrap_or_default();
            attr::multi_insert(self, attno, &[tid], &[datum], &[cell.is_none()])?;
        }
        Ok(tid)
    }

    /// Inserts a batch of rows, returning their TIDs. One TID-tree item
    /// and one set of attribute items cover the whole batch.
    pub fn multi_insert_rows(
        &self,
        txn: &Transaction,
        rows: &[Row],
    ) -> StrataResult<Vec<Tid>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        for row in rows {
            self.check_row_width(row)?;
        }
        let cid = txn.next_command();
        let tids = tid::multi_insert(self, rows.len(), None, txn.xid(), cid, 0, UndoPtr::INVALID)?;

        for col in 0..self.natts() {
            let attno = AttrNumber::new(col as u16 + 1);
            let datums: Vec<Bytes> = rows
                .iter()
                .map(|row| row[col].clone().unwrap_or_default())
                .collect();
            let isnulls: Vec<bool> = rows.iter().map(|row| row[col].is_none()).collect();
            attr::multi_insert(self, attno, &tids, &datums, &isnulls)?;
        }
        Ok(tids)
    }

    /// Deletes a row. Visibility conflicts come back as a `TmResult`,
    /// not an error.
    pub fn delete_row(&self, txn: &Transaction, tid: Tid) -> StrataResult<TmResult> {
        tid::delete(self, tid, txn.xid(), txn.next_command(), txn.snapshot(), false)
    }

    /// Updates a row: the old version is marked updated, the new values
    /// get a fresh TID at the right edge of the table. Returns the new
    /// TID on success.
    pub fn update_row(
        &self,
        txn: &Transaction,
        otid: Tid,
        row: &[Option<Bytes>],
    ) -> StrataResult<(TmResult, Option<Tid>)> {
        self.check_row_width(row)?;
        let cid = txn.next_command();
        let (result, newtid) = tid::update(self, otid, txn.xid(), cid, false, txn.snapshot())?;
        if result != TmResult::Ok {
            return Ok((result, None));
        }
        for (i, cell) in row.iter().enumerate() {
            let attno = AttrNumber::new(i as u16 + 1);
            let datum = cell.clone().unwrap_or_default();
            attr::multi_insert(self, attno, &[newtid], &[datum], &[cell.is_none()])?;
        }
        Ok((TmResult::Ok, Some(newtid)))
    }

    /// Locks a row without changing it.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        tid: Tid,
        mode: LockMode,
    ) -> StrataResult<(TmResult, Option<Tid>)> {
        tid::lock_tuple(self, tid, txn.xid(), txn.next_command(), mode, txn.snapshot())
    }

    /// Fetches one row by TID (index fetch). Returns `None` when the row
    /// does not exist or is not visible to the snapshot.
    pub fn fetch_row(&self, snapshot: &Snapshot, tid: Tid) -> StrataResult<Option<Row>> {
        let recent_oldest = self.undo().oldest_ptr();
        let Some(fetched) = tid::fetch(self, tid)? else {
            return Ok(None);
        };
        let item = fetched.item;
        drop(fetched);
        if item.is_dead() {
            return Ok(None);
        }
        let check = satisfies_visibility(
            self.undo(),
            self.transactions(),
            snapshot,
            recent_oldest,
            item.undo_ptr,
        );
        if !check.visible {
            return Ok(None);
        }

        let mut row = Vec::with_capacity(self.natts());
        for col in 0..self.natts() {
            let attno = AttrNumber::new(col as u16 + 1);
            row.push(attr::fetch(self, attno, tid)?);
        }
        Ok(Some(row))
    }

    /// Opens a full-table snapshot scan.
    pub fn begin_scan<'a>(&'a self, snapshot: &Snapshot) -> TableScan<'a> {
        self.begin_scan_range(snapshot, Tid::MIN, Tid::MAX_PLUS_ONE)
    }

    /// Opens a snapshot scan over the TID range `[starttid, endtid)`.
    pub fn begin_scan_range<'a>(
        &'a self,
        snapshot: &Snapshot,
        starttid: Tid,
        endtid: Tid,
    ) -> TableScan<'a> {
        let tid_scan = TidTreeScan::begin(self, snapshot, starttid, endtid);
        let attr_scans = (0..self.natts())
            .map(|col| AttrTreeScan::begin(self, AttrNumber::new(col as u16 + 1), starttid, endtid))
            .collect();
        TableScan {
            tid_scan,
            attr_scans,
        }
    }

    /// Vacuums the relation: advances the undo horizon (marking dead the
    /// rows whose deletion aged out, reverting aborted deletions), then
    /// repeatedly collects dead TIDs under the memory budget and removes
    /// them from every tree.
    pub fn vacuum(&self) -> StrataResult<VacuumStats> {
        self.advance_undo_horizon()?;

        let mut stats = VacuumStats::default();
        let mut start = Tid::MIN;
        loop {
            let (dead, resume) =
                tid::collect_dead_tids(self, start, self.config().maintenance_work_mem)?;
            stats.rounds += 1;
            if !dead.is_empty() {
                for col in 0..self.natts() {
                    let attno = AttrNumber::new(col as u16 + 1);
                    attr::remove(self, attno, &dead)?;
                }
                tid::remove(self, &dead)?;
                stats.removed_tids += dead.len() as u64;
            }
            if resume >= Tid::MAX_PLUS_ONE {
                break;
            }
            start = resume;
        }
        tracing::debug!(
            removed = stats.removed_tids,
            rounds = stats.rounds,
            "vacuum finished"
        );
        Ok(stats)
    }

    /// Applies and trims the all-visible prefix of the undo log:
    /// committed deletions and updates mark their old TIDs dead for
    /// vacuum; aborted inserts die too; aborted deletions are reverted.
    fn advance_undo_horizon(&self) -> StrataResult<()> {
        let horizon = self.transactions().global_xmin();
        let mut discard_to = self.undo().oldest_ptr();

        for (ptr, rec) in self.undo().snapshot_records() {
            let xid = rec.xid();
            if xid >= horizon {
                break;
            }
            let status = self.transactions().status(xid);
            match (&rec, status) {
                (UndoRecord::Delete { tid, .. }, XactStatus::Committed)
                | (UndoRecord::Update { tid, .. }, XactStatus::Committed) => {
                    tid::mark_dead(self, *tid)?;
                }
                (UndoRecord::Insert { tid, endtid, .. }, XactStatus::Aborted) => {
                    let mut cursor = *tid;
                    while cursor <= *endtid {
                        tid::mark_dead(self, cursor)?;
                        cursor = cursor.next();
                    }
                }
                (UndoRecord::Delete { tid, .. }, XactStatus::Aborted)
                | (UndoRecord::Update { tid, .. }, XactStatus::Aborted) => {
                    tid::undo_deletion(self, *tid, ptr)?;
                }
                _ => {}
            }
            discard_to = ptr.next();
        }
        self.undo().discard_up_to(discard_to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::EngineConfig;

    fn int_datum(v: i64) -> Option<Bytes> {
        Some(Bytes::from(v.to_le_bytes().to_vec()))
    }

    fn three_col_rel() -> Relation {
        Relation::create(
            vec![
                ColumnMeta::new("c1"),
                ColumnMeta::new("c2"),
                ColumnMeta::new("c3"),
            ],
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_fetch_row() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tid = rel
            .insert_row(&txn, &[int_datum(1), int_datum(2), None])
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let row = rel.fetch_row(&snapshot, tid).unwrap().unwrap();
        assert_eq!(row, vec![int_datum(1), int_datum(2), None]);
    }

    #[test]
    fn test_row_width_validated() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        assert!(rel.insert_row(&txn, &[int_datum(1)]).is_err());
    }

    #[test]
    fn test_scan_sees_committed_only() {
        let rel = three_col_rel();
        let committed = rel.transactions().begin();
        rel.insert_row(&committed, &[int_datum(1), int_datum(2), int_datum(3)])
            .unwrap();
        rel.transactions().commit(committed.xid()).unwrap();

        let pending = rel.transactions().begin();
        rel.insert_row(&pending, &[int_datum(4), int_datum(5), int_datum(6)])
            .unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = rel.begin_scan(&snapshot);
        let (_, row) = scan.next_row().unwrap().unwrap();
        assert_eq!(row[0], int_datum(1));
        assert!(scan.next_row().unwrap().is_none());
    }

    #[test]
    fn test_delete_then_scan() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tids = rel
            .multi_insert_rows(
                &txn,
                &(1..=10)
                    .map(|i| vec![int_datum(i), int_datum(i + 1), int_datum(i + 2)])
                    .collect::<Vec<_>>(),
            )
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let deleter = rel.transactions().begin();
        assert_eq!(rel.delete_row(&deleter, tids[4]).unwrap(), TmResult::Ok);
        rel.transactions().commit(deleter.xid()).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = rel.begin_scan(&snapshot);
        let mut seen = Vec::new();
        while let Some((_, row)) = scan.next_row().unwrap() {
            seen.push(i64::from_le_bytes(
                row[0].as_ref().unwrap().as_ref().try_into().unwrap(),
            ));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_update_row_moves_tid() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tid = rel
            .insert_row(&txn, &[int_datum(8), int_datum(9), int_datum(10)])
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let updater = rel.transactions().begin();
        let (result, newtid) = rel
            .update_row(&updater, tid, &[int_datum(8), int_datum(100), int_datum(10)])
            .unwrap();
        assert_eq!(result, TmResult::Ok);
        let newtid = newtid.unwrap();
        assert_ne!(newtid, tid);
        rel.transactions().commit(updater.xid()).unwrap();

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = rel.begin_scan(&snapshot);
        let mut rows = Vec::new();
        while let Some((scan_tid, row)) = scan.next_row().unwrap() {
            rows.push((scan_tid, row));
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, newtid);
        assert_eq!(rows[0].1[1], int_datum(100));

        // The old version is invisible to new snapshots but the chain
        // leads to the new one.
        assert!(rel.fetch_row(&snapshot, tid).unwrap().is_none());
        assert_eq!(
            tid::find_latest_tid(&rel, tid, &snapshot).unwrap(),
            Some(newtid)
        );
    }

    #[test]
    fn test_concurrent_delete_reports_tm_result() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tid = rel
            .insert_row(&txn, &[int_datum(1), int_datum(2), int_datum(3)])
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let first = rel.transactions().begin();
        let second = rel.transactions().begin();
        assert_eq!(rel.delete_row(&first, tid).unwrap(), TmResult::Ok);

        // Still in progress: the second deleter sees BeingModified.
        assert_eq!(
            rel.delete_row(&second, tid).unwrap(),
            TmResult::BeingModified
        );

        rel.transactions().commit(first.xid()).unwrap();
        // Now committed: Updated.
        assert_eq!(rel.delete_row(&second, tid).unwrap(), TmResult::Updated);
    }

    #[test]
    fn test_vacuum_reclaims_deleted_rows() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tids = rel
            .multi_insert_rows(
                &txn,
                &(0..50)
                    .map(|i| vec![int_datum(i), int_datum(i), int_datum(i)])
                    .collect::<Vec<_>>(),
            )
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let deleter = rel.transactions().begin();
        for tid in &tids {
            assert_eq!(rel.delete_row(&deleter, *tid).unwrap(), TmResult::Ok);
        }
        rel.transactions().commit(deleter.xid()).unwrap();

        let stats = rel.vacuum().unwrap();
        assert_eq!(stats.removed_tids, 50);

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = rel.begin_scan(&snapshot);
        assert!(scan.next_row().unwrap().is_none());

        // Vacuum completeness: a second pass finds nothing.
        let stats = rel.vacuum().unwrap();
        assert_eq!(stats.removed_tids, 0);
        assert_eq!(rel.undo().len(), 0);
    }

    #[test]
    fn test_vacuum_reverts_aborted_delete() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tid = rel
            .insert_row(&txn, &[int_datum(1), int_datum(2), int_datum(3)])
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        let deleter = rel.transactions().begin();
        rel.delete_row(&deleter, tid).unwrap();
        rel.transactions().abort(deleter.xid()).unwrap();

        rel.vacuum().unwrap();

        let snapshot = rel.transactions().snapshot_now();
        assert!(rel.fetch_row(&snapshot, tid).unwrap().is_some());
    }

    #[test]
    fn test_vacuum_reclaims_aborted_insert() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        rel.insert_row(&txn, &[int_datum(1), int_datum(2), int_datum(3)])
            .unwrap();
        rel.transactions().abort(txn.xid()).unwrap();

        let stats = rel.vacuum().unwrap();
        assert_eq!(stats.removed_tids, 1);

        let snapshot = rel.transactions().snapshot_now();
        let mut scan = rel.begin_scan(&snapshot);
        assert!(scan.next_row().unwrap().is_none());
    }

    #[test]
    fn test_vacuum_respects_active_snapshots() {
        let rel = three_col_rel();
        let txn = rel.transactions().begin();
        let tid = rel
            .insert_row(&txn, &[int_datum(1), int_datum(2), int_datum(3)])
            .unwrap();
        rel.transactions().commit(txn.xid()).unwrap();

        // An old reader is still running when the delete commits.
        let reader = rel.transactions().begin();
        let deleter = rel.transactions().begin();
        rel.delete_row(&deleter, tid).unwrap();
        rel.transactions().commit(deleter.xid()).unwrap();

        let stats = rel.vacuum().unwrap();
        assert_eq!(stats.removed_tids, 0, "row pinned by the old snapshot");
        assert!(rel.fetch_row(reader.snapshot(), tid).unwrap().is_some());

        rel.transactions().commit(reader.xid()).unwrap();
        let stats = rel.vacuum().unwrap();
        assert_eq!(stats.removed_tids, 1);
    }
}
