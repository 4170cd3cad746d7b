//! Identifier newtypes: blocks, attributes, transactions, undo pointers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_BLOCK_NUMBER;

/// Physical block number within a relation file.
///
/// Block 0 is always the metapage. `u32::MAX` is the invalid sentinel,
/// used to terminate right-link chains.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockNumber(u32);

impl BlockNumber {
    /// Invalid block number, used as a sentinel value.
    pub const INVALID: Self = Self(u32::MAX);

    /// The metapage block.
    pub const METAPAGE: Self = Self(0);

    /// Highest allocatable block number.
    pub const MAX: Self = Self(MAX_BLOCK_NUMBER);

    /// Creates a new `BlockNumber` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(block: u32) -> Self {
        Self(block)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a valid block number.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 <= MAX_BLOCK_NUMBER
    }
}

impl fmt::Debug for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "BlockNumber(INVALID)")
        } else {
            write!(f, "BlockNumber({})", self.0)
        }
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute number within a relation.
///
/// Attribute 0 is the TID tree (the "meta attribute" that carries
/// visibility information); user columns are numbered from 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AttrNumber(u16);

impl AttrNumber {
    /// The TID tree's attribute number.
    pub const TID_TREE: Self = Self(0);

    /// First user column.
    pub const FIRST: Self = Self(1);

    /// Creates a new `AttrNumber` from a raw u16 value.
    #[inline]
    #[must_use]
    pub const fn new(attno: u16) -> Self {
        Self(attno)
    }

    /// Returns the raw u16 value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// True for the TID tree's attribute number.
    #[inline]
    #[must_use]
    pub const fn is_tid_tree(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for AttrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrNumber({})", self.0)
    }
}

impl fmt::Display for AttrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier.
///
/// Monotonically increasing. `0` is invalid; `1` is the frozen
/// transaction id whose effects are visible to every snapshot and for
/// which no undo records are emitted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Invalid transaction id, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// The frozen transaction id: always committed, always visible.
    pub const FROZEN: Self = Self(1);

    /// First assignable normal transaction id.
    pub const FIRST_NORMAL: Self = Self(2);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(xid: u64) -> Self {
        Self(xid)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid transaction id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// True for ordinary (non-frozen) transaction ids.
    #[inline]
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => write!(f, "TxnId(INVALID)"),
            Self::FROZEN => write!(f, "TxnId(FROZEN)"),
            _ => write!(f, "TxnId({})", self.0),
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command identifier within a transaction.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct CommandId(u32);

impl CommandId {
    /// First command of a transaction.
    pub const FIRST: Self = Self(0);

    /// Creates a new `CommandId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(cid: u32) -> Self {
        Self(cid)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next command id.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({})", self.0)
    }
}

/// Opaque pointer into the undo log.
///
/// Undo pointers are monotonically increasing counters; comparing two
/// pointers orders the records they name. `0` is the invalid pointer,
/// stored on items whose history has been discarded (all-visible rows).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UndoPtr(u64);

impl UndoPtr {
    /// Invalid undo pointer: no undo record, row is all-visible.
    pub const INVALID: Self = Self(0);

    /// Creates a new `UndoPtr` from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(counter: u64) -> Self {
        Self(counter)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this pointer names a record.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the pointer one past this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Creates an UndoPtr from bytes (little-endian).
    #[inline]
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Converts to bytes (little-endian).
    #[inline]
    #[must_use]
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for UndoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "UndoPtr(INVALID)")
        } else {
            write!(f, "UndoPtr({})", self.0)
        }
    }
}

impl fmt::Display for UndoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
