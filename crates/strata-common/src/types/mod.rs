//! Core identifier types for StrataDB.
//!
//! These are type-safe wrappers around the raw integers that flow through
//! the engine, preventing accidental misuse of one identifier kind where
//! another is expected.

mod ids;
mod tid;

pub use ids::{AttrNumber, BlockNumber, CommandId, TxnId, UndoPtr};
pub use tid::Tid;
