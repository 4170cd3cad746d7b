//! The buffer pool: block-indexed frames plus a free list.

use parking_lot::{Mutex, RwLock};

use strata_common::constants::{BLOCK_SIZE, MAX_BLOCK_NUMBER};
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::BlockNumber;

use crate::page::{compute_page_checksum, page_kind, PageHeader, PageHeaderRef, PageKind};

use super::disk::DiskManager;
use super::frame::{Buffer, BufferFrame};

/// Holds every page of one relation, indexed by block number.
///
/// Freed pages (from unlinked leaves) are remembered in a free list and
/// handed out again by [`allocate`](Self::allocate) before the pool
/// extends the relation.
#[derive(Debug)]
pub struct BufferPool {
    frames: RwLock<Vec<Buffer>>,
    free_blocks: Mutex<Vec<BlockNumber>>,
    disk: Option<DiskManager>,
}

impl BufferPool {
    /// Creates an empty, purely in-memory pool.
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self {
            frames: RwLock::new(Vec::new()),
            free_blocks: Mutex::new(Vec::new()),
            disk: None,
        }
    }

    /// Creates an empty pool over a fresh relation file.
    pub fn create(path: impl AsRef<std::path::Path>) -> StrataResult<Self> {
        Ok(Self {
            frames: RwLock::new(Vec::new()),
            free_blocks: Mutex::new(Vec::new()),
            disk: Some(DiskManager::create(path)?),
        })
    }

    /// Opens an existing relation file, loading and verifying every page.
    pub fn open(path: impl AsRef<std::path::Path>) -> StrataResult<Self> {
        let disk = DiskManager::open(path)?;
        let nblocks = disk.nblocks()?;
        let mut frames = Vec::with_capacity(nblocks as usize);
        let mut free_blocks = Vec::new();

        for blkno in 0..nblocks {
            let block = BlockNumber::new(blkno);
            let mut bytes = vec![0u8; BLOCK_SIZE];
            disk.read_block(block, &mut bytes)?;

            let hdr = PageHeaderRef::new(&bytes);
            if hdr.is_valid_magic() {
                let expected = hdr.checksum();
                let actual = compute_page_checksum(&bytes);
                if expected != actual {
                    return Err(StrataError::ChecksumMismatch {
                        block,
                        expected,
                        actual,
                    });
                }
                if page_kind(&bytes) == PageKind::Free {
                    free_blocks.push(block);
                }
            }
            frames.push(Buffer::new(BufferFrame::new(block, bytes)));
        }

        Ok(Self {
            frames: RwLock::new(frames),
            free_blocks: Mutex::new(free_blocks),
            disk: Some(disk),
        })
    }

    /// Number of blocks in the relation.
    pub fn nblocks(&self) -> u32 {
        self.frames.read().len() as u32
    }

    /// Pins an existing block.
    pub fn pin(&self, block: BlockNumber) -> StrataResult<Buffer> {
        let frames = self.frames.read();
        frames
            .get(block.as_u32() as usize)
            .cloned()
            .ok_or(StrataError::BlockOutOfRange { block })
    }

    /// Allocates a page: reuses a freed block if one exists, otherwise
    /// extends the relation. The returned page's contents are whatever
    /// was there before; the caller initializes it.
    pub fn allocate(&self) -> StrataResult<Buffer> {
        if let Some(block) = self.free_blocks.lock().pop() {
            return self.pin(block);
        }
        let mut frames = self.frames.write();
        let blkno = frames.len() as u32;
        if blkno > MAX_BLOCK_NUMBER {
            return Err(StrataError::BlockOutOfRange {
                block: BlockNumber::new(blkno),
            });
        }
        let frame = Buffer::new(BufferFrame::new(
            BlockNumber::new(blkno),
            vec![0u8; BLOCK_SIZE],
        ));
        frames.push(Buffer::clone(&frame));
        Ok(frame)
    }

    /// Returns an unlinked block to the free list. The page must already
    /// have been rewritten as a [`PageKind::Free`] page.
    pub fn free_block(&self, block: BlockNumber) {
        self.free_blocks.lock().push(block);
    }

    /// Writes every dirty page (with a fresh checksum) to the backing
    /// file and syncs it. A no-op for in-memory pools.
    pub fn flush(&self) -> StrataResult<()> {
        let Some(disk) = &self.disk else {
            return Ok(());
        };
        let frames: Vec<Buffer> = self.frames.read().iter().cloned().collect();
        for frame in frames {
            if !frame.is_dirty() {
                continue;
            }
            let mut guard = frame.write();
            let checksum = {
                let mut hdr = PageHeader::new(guard.as_mut_slice());
                hdr.set_checksum(0);
                compute_page_checksum(&guard)
            };
            PageHeader::new(guard.as_mut_slice()).set_checksum(checksum);
            disk.write_block(frame.block(), &guard)?;
            frame.clear_dirty();
        }
        disk.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{init_tag_page, BtreeOpaque};
    use strata_common::types::AttrNumber;

    #[test]
    fn test_allocate_and_pin() {
        let pool = BufferPool::new_in_memory();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.block(), BlockNumber::new(0));
        assert_eq!(b.block(), BlockNumber::new(1));
        assert_eq!(pool.nblocks(), 2);

        let pinned = pool.pin(BlockNumber::new(1)).unwrap();
        assert_eq!(pinned.block(), b.block());
        assert!(pool.pin(BlockNumber::new(9)).is_err());
    }

    #[test]
    fn test_free_list_reuse() {
        let pool = BufferPool::new_in_memory();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        pool.free_block(a.block());
        let c = pool.allocate().unwrap();
        assert_eq!(c.block(), a.block());
        assert_eq!(pool.nblocks(), 2);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        {
            let pool = BufferPool::create(&path).unwrap();
            let meta = pool.allocate().unwrap();
            {
                let mut guard = meta.write();
                init_tag_page(guard.as_mut_slice(), PageKind::Meta);
                guard[100] = 55;
            }
            meta.mark_dirty();

            let leaf = pool.allocate().unwrap();
            {
                let mut guard = leaf.write();
                crate::page::init_btree_page(
                    guard.as_mut_slice(),
                    &BtreeOpaque::new_root_leaf(AttrNumber::TID_TREE),
                );
            }
            leaf.mark_dirty();
            pool.flush().unwrap();
            assert!(!meta.is_dirty());
        }

        let pool = BufferPool::open(&path).unwrap();
        assert_eq!(pool.nblocks(), 2);
        let meta = pool.pin(BlockNumber::new(0)).unwrap();
        assert_eq!(meta.read()[100], 55);
    }

    #[test]
    fn test_open_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        {
            let pool = BufferPool::create(&path).unwrap();
            let page = pool.allocate().unwrap();
            {
                let mut guard = page.write();
                init_tag_page(guard.as_mut_slice(), PageKind::Meta);
            }
            page.mark_dirty();
            pool.flush().unwrap();
        }
        // Corrupt a byte in the page body.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap();
            file.seek(SeekFrom::Start(1000)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }
        let err = BufferPool::open(&path).unwrap_err();
        assert!(matches!(err, StrataError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_open_rebuilds_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        {
            let pool = BufferPool::create(&path).unwrap();
            let a = pool.allocate().unwrap();
            {
                let mut guard = a.write();
                init_tag_page(guard.as_mut_slice(), PageKind::Free);
            }
            a.mark_dirty();
            pool.flush().unwrap();
        }
        let pool = BufferPool::open(&path).unwrap();
        // The freed page is reused before the file grows.
        let b = pool.allocate().unwrap();
        assert_eq!(b.block(), BlockNumber::new(0));
    }
}
