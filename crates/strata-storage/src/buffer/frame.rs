//! Buffer frame - holds one page in memory.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use strata_common::constants::BLOCK_SIZE;
use strata_common::types::BlockNumber;

/// Shared-lock guard over a page's bytes. Owned (not borrowed), so it can
/// be held across function boundaries.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Vec<u8>>;

/// Exclusive-lock guard over a page's bytes. Split stacks hold these for
/// every page they will overwrite until the whole change is applied.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Vec<u8>>;

/// A pinned reference to a buffer frame. Cloning pins; dropping unpins.
pub type Buffer = Arc<BufferFrame>;

/// A buffer frame holds a single page in memory.
///
/// The page bytes sit behind a `RwLock`; the dirty flag is atomic so it
/// can be set while holding either lock mode.
#[derive(Debug)]
pub struct BufferFrame {
    block: BlockNumber,
    data: Arc<RwLock<Vec<u8>>>,
    dirty: AtomicBool,
}

impl BufferFrame {
    /// Creates a frame over the given page bytes.
    pub(crate) fn new(block: BlockNumber, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), BLOCK_SIZE);
        Self {
            block,
            data: Arc::new(RwLock::new(bytes)),
            dirty: AtomicBool::new(false),
        }
    }

    /// The block this frame holds.
    #[inline]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Takes the page lock in share mode.
    pub fn read(&self) -> PageReadGuard {
        self.data.read_arc()
    }

    /// Takes the page lock in exclusive mode.
    pub fn write(&self) -> PageWriteGuard {
        self.data.write_arc()
    }

    /// Tries to take the page lock in exclusive mode without blocking.
    pub fn try_write(&self) -> Option<PageWriteGuard> {
        self.data.try_write_arc()
    }

    /// Marks the page as modified since the last flush.
    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, AtomicOrdering::Release);
    }

    /// Whether the page has been modified since the last flush.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(AtomicOrdering::Acquire)
    }

    /// Clears the dirty flag (after a successful flush).
    #[inline]
    pub fn clear_dirty(&self) {
        self.dirty.store(false, AtomicOrdering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> BufferFrame {
        BufferFrame::new(BlockNumber::new(3), vec![0u8; BLOCK_SIZE])
    }

    #[test]
    fn test_read_write() {
        let frame = frame();
        {
            let mut guard = frame.write();
            guard[0] = 42;
        }
        let guard = frame.read();
        assert_eq!(guard[0], 42);
        assert_eq!(frame.block(), BlockNumber::new(3));
    }

    #[test]
    fn test_try_write_contention() {
        let frame = Arc::new(frame());
        let _read = frame.read();
        assert!(frame.try_write().is_none());
        drop(_read);
        assert!(frame.try_write().is_some());
    }

    #[test]
    fn test_dirty_flag() {
        let frame = frame();
        assert!(!frame.is_dirty());
        frame.mark_dirty();
        assert!(frame.is_dirty());
        frame.clear_dirty();
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_guard_is_owned() {
        // The guard must be storable without borrowing the frame.
        let frame = Arc::new(frame());
        let guard: PageWriteGuard = frame.write();
        let holder = (Arc::clone(&frame), guard);
        drop(holder);
        let _ = frame.read();
    }
}
