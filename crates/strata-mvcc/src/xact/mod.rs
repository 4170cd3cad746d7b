//! Transaction lifecycle management.
//!
//! Transactions are identified by monotonically increasing [`TxnId`]s.
//! The manager tracks each transaction's state (in progress, committed,
//! aborted) for visibility checks; the states are retained for the life
//! of the manager so that undo-chain walks can always classify a xid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

use parking_lot::RwLock;

use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{CommandId, TxnId};

use crate::snapshot::Snapshot;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactStatus {
    /// The transaction is running.
    InProgress,
    /// The transaction committed.
    Committed,
    /// The transaction aborted.
    Aborted,
}

#[derive(Debug)]
struct TxnState {
    status: XactStatus,
    serializable: bool,
    /// A serializable read by this transaction skipped a row obsoleted by
    /// a concurrent writer; committing such a transaction must fail.
    conflict_out: bool,
    /// Oldest xid this transaction's snapshot might still need: its own,
    /// or the oldest transaction that was active when it began. Bounds
    /// how far the undo horizon may advance.
    xmin: TxnId,
}

/// A handle to a running transaction.
///
/// Carries the xid, the per-statement command counter, and the snapshot
/// taken at begin. The handle is cheap to share by reference; the command
/// counter advances atomically.
#[derive(Debug)]
pub struct Transaction {
    xid: TxnId,
    next_cid: AtomicU32,
    snapshot: Snapshot,
}

impl Transaction {
    /// Returns this transaction's id.
    #[inline]
    #[must_use]
    pub fn xid(&self) -> TxnId {
        self.xid
    }

    /// Returns the snapshot taken when the transaction began.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Allocates the command id for the next statement.
    pub fn next_command(&self) -> CommandId {
        CommandId::new(self.next_cid.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

/// Allocates transaction ids and tracks commit state.
#[derive(Debug)]
pub struct TransactionManager {
    /// Next transaction id to assign.
    next_xid: AtomicU64,
    /// Every transaction ever begun, by id.
    states: RwLock<HashMap<TxnId, TxnState>>,
}

impl TransactionManager {
    /// Creates a new transaction manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU64::new(TxnId::FIRST_NORMAL.as_u64()),
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Begins a snapshot-isolation transaction.
    pub fn begin(&self) -> Transaction {
        self.begin_internal(false)
    }

    /// Begins a serializable transaction.
    pub fn begin_serializable(&self) -> Transaction {
        self.begin_internal(true)
    }

    fn begin_internal(&self, serializable: bool) -> Transaction {
        let xid = TxnId::new(self.next_xid.fetch_add(1, AtomicOrdering::SeqCst));
        let mut states = self.states.write();
        let xmin = states
            .iter()
            .filter(|(_, state)| state.status == XactStatus::InProgress)
            .map(|(other, _)| *other)
            .min()
            .unwrap_or(xid)
            .min(xid);
        states.insert(
            xid,
            TxnState {
                status: XactStatus::InProgress,
                serializable,
                conflict_out: false,
                xmin,
            },
        );
        drop(states);
        let snapshot = self.take_snapshot(xid, serializable);
        Transaction {
            xid,
            next_cid: AtomicU32::new(CommandId::FIRST.as_u32()),
            snapshot,
        }
    }

    /// Takes a snapshot not owned by any transaction (read-only queries).
    pub fn snapshot_now(&self) -> Snapshot {
        self.take_snapshot(TxnId::INVALID, false)
    }

    fn take_snapshot(&self, owner: TxnId, serializable: bool) -> Snapshot {
        // A xid allocated but not yet registered in `states` classifies as
        // aborted until registration, so a racing begin() is invisible to
        // this snapshot either way.
        let states = self.states.read();
        let xmax = TxnId::new(self.next_xid.load(AtomicOrdering::SeqCst));
        let active = states
            .iter()
            .filter(|(xid, state)| {
                state.status == XactStatus::InProgress && **xid != owner
            })
            .map(|(xid, _)| *xid)
            .collect();
        Snapshot::new(owner, xmax, active, serializable)
    }

    /// Commits a transaction.
    ///
    /// A serializable transaction that skipped concurrently-obsoleted rows
    /// fails here with `SerializationFailure` and is aborted instead.
    pub fn commit(&self, xid: TxnId) -> StrataResult<()> {
        let mut states = self.states.write();
        let state = states
            .get_mut(&xid)
            .ok_or(StrataError::TransactionNotActive { xid })?;
        if state.status != XactStatus::InProgress {
            return Err(StrataError::TransactionNotActive { xid });
        }
        if state.serializable && state.conflict_out {
            state.status = XactStatus::Aborted;
            return Err(StrataError::SerializationFailure { xid });
        }
        state.status = XactStatus::Committed;
        Ok(())
    }

    /// Aborts a transaction.
    pub fn abort(&self, xid: TxnId) -> StrataResult<()> {
        let mut states = self.states.write();
        let state = states
            .get_mut(&xid)
            .ok_or(StrataError::TransactionNotActive { xid })?;
        if state.status != XactStatus::InProgress {
            return Err(StrataError::TransactionNotActive { xid });
        }
        state.status = XactStatus::Aborted;
        Ok(())
    }

    /// Returns the state of a transaction.
    ///
    /// The frozen xid is always committed; an unknown xid is treated as
    /// aborted (its effects must never become visible).
    pub fn status(&self, xid: TxnId) -> XactStatus {
        if xid == TxnId::FROZEN {
            return XactStatus::Committed;
        }
        self.states
            .read()
            .get(&xid)
            .map(|state| state.status)
            .unwrap_or(XactStatus::Aborted)
    }

    /// True if the transaction committed.
    pub fn is_committed(&self, xid: TxnId) -> bool {
        self.status(xid) == XactStatus::Committed
    }

    /// True if the transaction is still running.
    pub fn is_in_progress(&self, xid: TxnId) -> bool {
        self.status(xid) == XactStatus::InProgress
    }

    /// Returns the oldest xid that is still in progress, or the next
    /// unassigned xid if none is.
    pub fn oldest_active_xid(&self) -> TxnId {
        let states = self.states.read();
        states
            .iter()
            .filter(|(_, state)| state.status == XactStatus::InProgress)
            .map(|(xid, _)| *xid)
            .min()
            .unwrap_or_else(|| TxnId::new(self.next_xid.load(AtomicOrdering::SeqCst)))
    }

    /// Returns the global undo horizon: every transaction below it has
    /// finished *and* is visible (or invisible) identically to every
    /// active snapshot. Undo records older than this can be applied and
    /// discarded.
    pub fn global_xmin(&self) -> TxnId {
        let states = self.states.read();
        states
            .iter()
            .filter(|(_, state)| state.status == XactStatus::InProgress)
            .map(|(_, state)| state.xmin)
            .min()
            .unwrap_or_else(|| TxnId::new(self.next_xid.load(AtomicOrdering::SeqCst)))
    }

    /// Records that `reader` skipped a row obsoleted by `writer`.
    ///
    /// Only serializable readers care; for them the conflict surfaces at
    /// commit time as a serialization failure.
    pub fn report_conflict_out(&self, reader: TxnId, writer: TxnId) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(&reader) {
            if state.serializable && state.status == XactStatus::InProgress {
                tracing::debug!(
                    reader = reader.as_u64(),
                    writer = writer.as_u64(),
                    "serializable conflict out"
                );
                state.conflict_out = true;
            }
        }
    }

    /// Returns the number of in-progress transactions.
    pub fn active_count(&self) -> usize {
        self.states
            .read()
            .values()
            .filter(|state| state.status == XactStatus::InProgress)
            .count()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
