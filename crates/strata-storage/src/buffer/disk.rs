//! Block-granular file I/O.
//!
//! A relation file is a plain sequence of `BLOCK_SIZE` pages. The file
//! handle sits behind a mutex; the engine is synchronous and every read
//! and write is a seek + full-block transfer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use strata_common::constants::BLOCK_SIZE;
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::BlockNumber;

/// Synchronous block I/O over one relation file.
#[derive(Debug)]
pub struct DiskManager {
    file: Mutex<File>,
    path: PathBuf,
}

impl DiskManager {
    /// Creates a new (empty) relation file, truncating any existing one.
    pub fn create(path: impl AsRef<Path>) -> StrataResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Opens an existing relation file.
    pub fn open(path: impl AsRef<Path>) -> StrataResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(StrataError::corruption(format!(
                "relation file {} is not a whole number of blocks ({len} bytes)",
                path.display()
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks currently in the file.
    pub fn nblocks(&self) -> StrataResult<u32> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        Ok((len / BLOCK_SIZE as u64) as u32)
    }

    /// Reads one block into `buf`.
    pub fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> StrataResult<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block.as_u32() as u64 * BLOCK_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes one block. Extends the file if the block is past the end.
    pub fn write_block(&self, block: BlockNumber, buf: &[u8]) -> StrataResult<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block.as_u32() as u64 * BLOCK_SIZE as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Forces written data to stable storage.
    pub fn sync(&self) -> StrataResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        let disk = DiskManager::create(&path).unwrap();

        let mut page = vec![0u8; BLOCK_SIZE];
        page[7] = 99;
        disk.write_block(BlockNumber::new(2), &page).unwrap();
        assert_eq!(disk.nblocks().unwrap(), 3);

        let mut readback = vec![0u8; BLOCK_SIZE];
        disk.read_block(BlockNumber::new(2), &mut readback).unwrap();
        assert_eq!(readback[7], 99);

        // Blocks 0 and 1 exist as zero fill.
        disk.read_block(BlockNumber::new(0), &mut readback).unwrap();
        assert_eq!(readback, vec![0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_open_rejects_ragged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        std::fs::write(&path, vec![0u8; BLOCK_SIZE + 1]).unwrap();
        assert!(DiskManager::open(&path).is_err());
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        {
            let disk = DiskManager::create(&path).unwrap();
            let mut page = vec![0u8; BLOCK_SIZE];
            page[0] = 1;
            disk.write_block(BlockNumber::new(0), &page).unwrap();
            disk.sync().unwrap();
        }
        let disk = DiskManager::open(&path).unwrap();
        assert_eq!(disk.nblocks().unwrap(), 1);
        let mut page = vec![0u8; BLOCK_SIZE];
        disk.read_block(BlockNumber::new(0), &mut page).unwrap();
        assert_eq!(page[0], 1);
    }
}
