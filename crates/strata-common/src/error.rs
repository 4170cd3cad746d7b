//! Error handling for StrataDB.
//!
//! One unified error type is used across all components. Structural
//! invariant violations carry enough context to identify the offending
//! `(attno, tid, block)`; visibility outcomes are *not* errors and are
//! reported through `TmResult` values instead.

use thiserror::Error;

use crate::types::{AttrNumber, BlockNumber, Tid, TxnId};

/// Result type alias for StrataDB operations.
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// The unified error type for StrataDB.
#[derive(Debug, Error)]
pub enum StrataError {
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Data corruption or broken structural invariant.
    #[error("data corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Page checksum did not match on load.
    #[error("checksum mismatch on block {block}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// The corrupted block.
        block: BlockNumber,
        /// Checksum stored on the page.
        expected: u32,
        /// Checksum computed from the page contents.
        actual: u32,
    },

    /// A block number beyond the end of the relation was requested.
    #[error("block {block} is out of range")]
    BlockOutOfRange {
        /// The requested block.
        block: BlockNumber,
    },

    /// A page did not have the expected identity after descent.
    #[error("unexpected page at block {block} of attribute {attno}: {reason}")]
    UnexpectedPage {
        /// The tree the descent was in.
        attno: AttrNumber,
        /// The offending block.
        block: BlockNumber,
        /// What was wrong.
        reason: String,
    },

    /// A TID the contract requires to be present was not found.
    #[error("tuple {tid} not found in TID tree")]
    TidNotFound {
        /// The missing TID.
        tid: Tid,
    },

    /// An operation targeted a TID already marked dead.
    #[error("tuple {tid} is already marked dead")]
    TidIsDead {
        /// The dead TID.
        tid: Tid,
    },

    /// Two items claim the same TID on an attribute page.
    #[error("duplicate value for attribute {attno} at tid {tid} on block {block}")]
    DuplicateAttrValue {
        /// The attribute tree.
        attno: AttrNumber,
        /// The duplicated TID.
        tid: Tid,
        /// The page where the collision was detected.
        block: BlockNumber,
    },

    /// Item ordering or range-overlap invariant violated on a page.
    #[error("item ordering violated on block {block} of attribute {attno}")]
    ItemOrdering {
        /// The tree the page belongs to.
        attno: AttrNumber,
        /// The offending block.
        block: BlockNumber,
    },

    /// A tuple was modified concurrently between the steps of an update.
    #[error("tuple {tid} was concurrently updated")]
    ConcurrentUpdate {
        /// The contended TID.
        tid: Tid,
    },

    /// A datum is too large to store on a page (out-of-line storage is
    /// not implemented).
    #[error("datum of {size} bytes exceeds maximum {max}")]
    DatumTooLarge {
        /// Actual datum size.
        size: usize,
        /// Largest storable datum.
        max: usize,
    },

    /// An integer value cannot be represented as a TID.
    #[error("value {value} is out of range for tid")]
    TidOutOfRange {
        /// The rejected value.
        value: i64,
    },

    /// A serializable transaction observed a conflicting concurrent write.
    #[error("could not serialize access due to concurrent update (xid {xid})")]
    SerializationFailure {
        /// The failing transaction.
        xid: TxnId,
    },

    /// Commit or abort of a transaction that is not in progress.
    #[error("transaction {xid} is not active")]
    TransactionNotActive {
        /// The offending transaction id.
        xid: TxnId,
    },

    /// Invalid argument provided by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl StrataError {
    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// True for errors that indicate on-disk or in-memory structure
    /// damage. These are never retried.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::ChecksumMismatch { .. }
                | Self::UnexpectedPage { .. }
                | Self::DuplicateAttrValue { .. }
                | Self::ItemOrdering { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrataError::TidNotFound { tid: Tid::new(0x1_0002) };
        assert_eq!(err.to_string(), "tuple (1, 2) not found in TID tree");

        let err = StrataError::corruption("right-link cycle");
        assert!(err.to_string().contains("right-link cycle"));
    }

    #[test]
    fn test_corruption_classification() {
        assert!(StrataError::corruption("x").is_corruption());
        assert!(StrataError::DuplicateAttrValue {
            attno: AttrNumber::FIRST,
            tid: Tid::MIN,
            block: BlockNumber::new(1),
        }
        .is_corruption());
        assert!(!StrataError::TidNotFound { tid: Tid::MIN }.is_corruption());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io { .. }));
    }
}
