//! The 48-bit logical tuple identifier.
//!
//! Throughout StrataDB, row identifiers are passed around as plain 64-bit
//! integers holding a 48-bit value, rather than as (block, offset) pairs,
//! for speed. The external projection is `block = tid >> 16`,
//! `offset = tid & 0xFFFF`.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_BLOCK_NUMBER;
use crate::error::StrataError;

use super::ids::BlockNumber;

/// Logical tuple identifier: a strictly positive 48-bit integer.
///
/// `0` is reserved as the invalid TID; [`Tid::MAX_PLUS_ONE`] is the
/// exclusive upper-bound sentinel used for page high keys and scan ends.
/// TIDs are assigned monotonically per table.
///
/// # Example
///
/// ```rust
/// use strata_common::types::Tid;
///
/// let tid = Tid::try_from(0x2_0005i64).unwrap();
/// assert_eq!(tid.block().as_u32(), 2);
/// assert_eq!(tid.offset(), 5);
/// assert!(Tid::MIN <= tid && tid <= Tid::MAX);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Tid(u64);

impl Tid {
    /// Invalid TID, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// Smallest valid TID (block 0, offset 1).
    pub const MIN: Self = Self(1);

    /// Largest valid TID.
    pub const MAX: Self = Self(((MAX_BLOCK_NUMBER as u64) << 16) | 0xFFFF);

    /// Exclusive upper-bound sentinel. Never a valid row identifier;
    /// appears as the high key of the rightmost page of every tree.
    pub const MAX_PLUS_ONE: Self = Self(Self::MAX.0 + 1);

    /// Creates a `Tid` from a raw u64 value.
    ///
    /// The value is not range-checked; use [`TryFrom`] for untrusted input.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks that this is a valid row identifier (not the invalid or
    /// upper-bound sentinel).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= Self::MIN.0 && self.0 <= Self::MAX.0
    }

    /// Returns the block-number projection (`tid >> 16`).
    #[inline]
    #[must_use]
    pub fn block(self) -> BlockNumber {
        BlockNumber::new((self.0 >> 16) as u32)
    }

    /// Returns the offset projection (`tid & 0xFFFF`).
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Builds a TID from its (block, offset) projection.
    #[inline]
    #[must_use]
    pub fn from_block_offset(block: BlockNumber, offset: u16) -> Self {
        Self(((block.as_u32() as u64) << 16) | offset as u64)
    }

    /// Returns the next TID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous TID.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Creates a Tid from bytes (little-endian).
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

impl Add<u64> for Tid {
    type Output = Tid;

    #[inline]
    fn add(self, rhs: u64) -> Tid {
        Tid(self.0 + rhs)
    }
}

impl AddAssign<u64> for Tid {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<Tid> for Tid {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Tid) -> u64 {
        debug_assert!(self.0 >= rhs.0, "tid subtraction underflow");
        self.0 - rhs.0
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Tid(INVALID)")
        } else if *self == Self::MAX_PLUS_ONE {
            write!(f, "Tid(MAX+1)")
        } else {
            write!(f, "Tid({}/{})", self.block().as_u32(), self.offset())
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block().as_u32(), self.offset())
    }
}

// The SQL-visible type surface: explicit, fallible conversions from the
// signed integer types, widening conversions out, and literal parsing.
// There are deliberately no implicit numeric conversions and no negation.

impl TryFrom<i64> for Tid {
    type Error = StrataError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < Self::MIN.0 as i64 || value > Self::MAX.0 as i64 {
            return Err(StrataError::TidOutOfRange { value });
        }
        Ok(Self(value as u64))
    }
}

impl TryFrom<i32> for Tid {
    type Error = StrataError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::try_from(value as i64)
    }
}

impl TryFrom<i16> for Tid {
    type Error = StrataError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Self::try_from(value as i64)
    }
}

impl From<Tid> for i64 {
    #[inline]
    fn from(tid: Tid) -> i64 {
        tid.0 as i64
    }
}

impl From<Tid> for u64 {
    #[inline]
    fn from(tid: Tid) -> u64 {
        tid.0
    }
}

impl FromStr for Tid {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| StrataError::InvalidArgument {
                message: format!("invalid tid literal: {s:?}"),
            })?;
        Self::try_from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_round_trip() {
        let tid = Tid::new(0xABCD_0042);
        assert_eq!(tid.block(), BlockNumber::new(0xABCD));
        assert_eq!(tid.offset(), 0x42);
        assert_eq!(Tid::from_block_offset(tid.block(), tid.offset()), tid);
    }

    #[test]
    fn test_sentinels() {
        assert!(!Tid::INVALID.is_valid());
        assert!(Tid::MIN.is_valid());
        assert!(Tid::MAX.is_valid());
        assert!(!Tid::MAX_PLUS_ONE.is_valid());
        assert_eq!(Tid::MAX.next(), Tid::MAX_PLUS_ONE);
    }

    #[test]
    fn test_arithmetic() {
        let tid = Tid::new(100);
        assert_eq!(tid + 5, Tid::new(105));
        assert_eq!(Tid::new(105) - tid, 5);
        assert_eq!(tid.next(), Tid::new(101));
        assert_eq!(tid.prev(), Tid::new(99));
    }

    #[test]
    fn test_literal_parse() {
        assert_eq!("1".parse::<Tid>().unwrap(), Tid::MIN);
        assert!("-1".parse::<Tid>().is_err());
        assert!("0".parse::<Tid>().is_err());
        assert!("zap".parse::<Tid>().is_err());
    }

    #[test]
    fn test_casts() {
        // Widening in is fine.
        assert_eq!(Tid::try_from(1i16).unwrap(), Tid::MIN);
        assert_eq!(Tid::try_from(7i32).unwrap(), Tid::new(7));
        // Out of the 48-bit range is rejected.
        assert!(Tid::try_from(1_000_000_000_000_000i64).is_err());
        assert!(Tid::try_from(-1i64).is_err());
        assert!(Tid::try_from(0i64).is_err());
        // Widening out.
        assert_eq!(i64::from(Tid::new(9)), 9);
        assert_eq!(u64::from(Tid::new(9)), 9);
    }

    #[test]
    fn test_ordering() {
        assert!(Tid::new(1) < Tid::new(2));
        assert!(Tid::MAX < Tid::MAX_PLUS_ONE);
    }
}
