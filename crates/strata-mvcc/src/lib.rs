//! # strata-mvcc
//!
//! Multi-version concurrency control for StrataDB.
//!
//! The storage engine keeps exactly one physical version of each row; all
//! older states live in an append-only **undo log**. Every row item carries
//! an [`UndoPtr`](strata_common::UndoPtr) naming the newest undo record
//! that affects it; records chain backwards through their `prev` pointers.
//! Visibility of a row under a [`Snapshot`] is decided by walking that
//! chain.
//!
//! This crate provides:
//!
//! - [`TransactionManager`] / [`Transaction`]: xid allocation and
//!   commit/abort state
//! - [`Snapshot`]: a consistent view of which transactions are visible
//! - [`UndoLog`] / [`UndoRecord`]: the append-only undo log
//! - [`satisfies_visibility`] / [`satisfies_update`]: the visibility
//!   checks consumed by the trees

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod snapshot;
pub mod undo;
pub mod visibility;
pub mod xact;

pub use snapshot::Snapshot;
pub use undo::{LockMode, UndoLog, UndoRecord};
pub use visibility::{
    satisfies_update, satisfies_visibility, TmResult, UpdateCheck, VisibilityCheck,
};
pub use xact::{Transaction, TransactionManager, XactStatus};
