//! The TID array item: a dense run of row identifiers.

use bitflags::bitflags;

use strata_common::types::{Tid, UndoPtr};

bitflags! {
    /// Flags on a TID array item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TidItemFlags: u8 {
        /// The run is deleted-and-reclaimable; never visible to any
        /// snapshot. Set by undo application, cleared only by vacuum
        /// physically removing the run.
        const DEAD = 0x01;
    }
}

/// One item on a TID-tree leaf: the dense run
/// `[first, first + nelements)`, all sharing one undo pointer.
///
/// # On-page encoding (21 bytes)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
///   0       8   first
///   8       4   nelements
///  12       8   undo_ptr
///  20       1   flags
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TidArrayItem {
    /// First TID of the run.
    pub first: Tid,
    /// Number of consecutive TIDs, at least 1.
    pub nelements: u32,
    /// Undo pointer shared by every TID in the run.
    pub undo_ptr: UndoPtr,
    /// Item flags.
    pub flags: TidItemFlags,
}

impl TidArrayItem {
    /// Encoded size of an item on a page.
    pub const ENCODED_SIZE: usize = 21;

    /// Creates a live run item.
    #[must_use]
    pub fn new(first: Tid, nelements: u32, undo_ptr: UndoPtr) -> Self {
        debug_assert!(nelements >= 1);
        Self {
            first,
            nelements,
            undo_ptr,
            flags: TidItemFlags::empty(),
        }
    }

    /// Creates a single-TID dead item.
    #[must_use]
    pub fn dead(tid: Tid) -> Self {
        Self {
            first: tid,
            nelements: 1,
            undo_ptr: UndoPtr::INVALID,
            flags: TidItemFlags::DEAD,
        }
    }

    /// Last TID of the run (inclusive).
    #[inline]
    #[must_use]
    pub fn last(&self) -> Tid {
        self.first + (self.nelements as u64 - 1)
    }

    /// One past the last TID of the run.
    #[inline]
    #[must_use]
    pub fn end(&self) -> Tid {
        self.first + self.nelements as u64
    }

    /// True if `tid` falls inside the run.
    #[inline]
    #[must_use]
    pub fn covers(&self, tid: Tid) -> bool {
        self.first <= tid && tid < self.end()
    }

    /// True for vacuum-reclaimable runs.
    #[inline]
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.flags.contains(TidItemFlags::DEAD)
    }

    /// Encodes the item for on-page storage.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        bytes[0..8].copy_from_slice(&self.first.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.nelements.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.undo_ptr.to_le_bytes());
        bytes[20] = self.flags.bits();
        bytes
    }

    /// Decodes an item from its on-page bytes.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), Self::ENCODED_SIZE, "bad tid item length");
        let mut first = [0u8; 8];
        first.copy_from_slice(&bytes[0..8]);
        let mut nelements = [0u8; 4];
        nelements.copy_from_slice(&bytes[8..12]);
        let mut undo = [0u8; 8];
        undo.copy_from_slice(&bytes[12..20]);
        Self {
            first: Tid::from_le_bytes(first),
            nelements: u32::from_le_bytes(nelements),
            undo_ptr: UndoPtr::from_le_bytes(undo),
            flags: TidItemFlags::from_bits_truncate(bytes[20]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_bounds() {
        let item = TidArrayItem::new(Tid::new(10), 5, UndoPtr::new(3));
        assert_eq!(item.last(), Tid::new(14));
        assert_eq!(item.end(), Tid::new(15));
        assert!(item.covers(Tid::new(10)));
        assert!(item.covers(Tid::new(14)));
        assert!(!item.covers(Tid::new(15)));
        assert!(!item.covers(Tid::new(9)));
        assert!(!item.is_dead());
    }

    #[test]
    fn test_dead_item() {
        let item = TidArrayItem::dead(Tid::new(42));
        assert!(item.is_dead());
        assert_eq!(item.nelements, 1);
        assert_eq!(item.undo_ptr, UndoPtr::INVALID);
    }

    #[test]
    fn test_encode_decode() {
        let item = TidArrayItem {
            first: Tid::new(0xAB_CDEF),
            nelements: 1000,
            undo_ptr: UndoPtr::new(77),
            flags: TidItemFlags::DEAD,
        };
        let decoded = TidArrayItem::decode(&item.encode());
        assert_eq!(decoded, item);
    }
}
