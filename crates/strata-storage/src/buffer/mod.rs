//! Buffer management.
//!
//! Pages live in [`BufferFrame`]s owned by the [`BufferPool`]. A *pin* is
//! an `Arc` clone of the frame: the frame cannot go away while anyone
//! holds one. A *lock* is the frame's page `RwLock`: share for readers,
//! exclusive for mutators. The two are independent, exactly as the
//! locking discipline requires - a scan keeps a pin on its last page
//! across calls but holds the lock only while reading it.
//!
//! The pool has no eviction: a relation's pages stay resident, and
//! [`BufferPool::flush`] writes the dirty ones (with fresh checksums)
//! back to the backing file, if there is one.

mod disk;
mod frame;
mod pool;

pub use disk::DiskManager;
pub use frame::{Buffer, BufferFrame, PageReadGuard, PageWriteGuard};
pub use pool::BufferPool;
