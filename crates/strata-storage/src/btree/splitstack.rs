//! The split stack: atomic multi-page structural changes.
//!
//! A structural change (split, unlink, root growth) is prepared entirely
//! in private memory: for every page it will touch, the stack holds the
//! page's frame, the *already acquired* exclusive guard, and the new page
//! image. Buffers for brand-new pages are allocated (and locked) while
//! the stack is being built, so by the time [`SplitStack::apply`] runs
//! there is nothing left that can fail: it only copies images over pages
//! and releases the guards.
//!
//! Entries are ordered left-to-right within a level and child-before-
//! parent across levels, matching the lock acquisition order. A guard is
//! released only after its own image is in place, so a reader chasing a
//! right-link or downlink into a not-yet-applied page simply blocks on
//! that page's lock until its image lands.

use strata_common::constants::BLOCK_SIZE;
use strata_common::types::BlockNumber;

use crate::buffer::{Buffer, BufferPool, PageWriteGuard};

/// One page to overwrite: its frame, the held exclusive guard, and the
/// image to install.
pub struct SplitStackEntry {
    /// The pinned frame.
    pub buf: Buffer,
    /// The exclusive guard, held since the entry was built.
    pub guard: PageWriteGuard,
    /// The complete new page image.
    pub image: Vec<u8>,
}

impl std::fmt::Debug for SplitStackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitStackEntry")
            .field("block", &self.buf.block())
            .finish()
    }
}

/// An ordered set of page overwrites applied as one structural change.
#[derive(Debug, Default)]
pub struct SplitStack {
    entries: Vec<SplitStackEntry>,
    freed: Vec<BlockNumber>,
}

impl SplitStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page overwrite.
    pub fn push(&mut self, buf: Buffer, guard: PageWriteGuard, image: Vec<u8>) {
        debug_assert_eq!(image.len(), BLOCK_SIZE);
        self.entries.push(SplitStackEntry { buf, guard, image });
    }

    /// Records a block that becomes free once the change is applied.
    pub fn add_freed(&mut self, block: BlockNumber) {
        self.freed.push(block);
    }

    /// Appends another stack's entries after this one's (parents after
    /// children).
    pub fn append(&mut self, mut other: SplitStack) {
        self.entries.append(&mut other.entries);
        self.freed.append(&mut other.freed);
    }

    /// Number of page overwrites in the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the stack holds no overwrites.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Installs every image, marks the frames dirty, releases the guards,
    /// and returns freed blocks to the pool. Infallible by construction.
    pub fn apply(self, pool: &BufferPool) {
        for mut entry in self.entries {
            entry.guard.as_mut_slice().copy_from_slice(&entry.image);
            entry.buf.mark_dirty();
            // Guard drops here: the page becomes visible in its new form.
        }
        for block in self.freed {
            pool.free_block(block);
        }
    }
}
