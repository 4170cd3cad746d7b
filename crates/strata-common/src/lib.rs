//! # strata-common
//!
//! Common types, errors, and configuration for StrataDB.
//!
//! This crate provides the foundational types shared by every StrataDB
//! component:
//!
//! - **Types**: Core identifiers (`Tid`, `BlockNumber`, `AttrNumber`,
//!   `TxnId`, `CommandId`, `UndoPtr`)
//! - **Errors**: Unified error handling with `StrataError`
//! - **Config**: Engine configuration
//! - **Constants**: System-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use strata_common::types::{AttrNumber, BlockNumber, Tid};
//! use strata_common::error::StrataResult;
//!
//! fn example() -> StrataResult<()> {
//!     let tid = Tid::try_from(42i64)?;
//!     assert_eq!(tid.block(), BlockNumber::new(0));
//!     assert_eq!(tid.offset(), 42);
//!     let _attno = AttrNumber::new(1);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::EngineConfig;
pub use error::{StrataError, StrataResult};
pub use types::{AttrNumber, BlockNumber, CommandId, Tid, TxnId, UndoPtr};
