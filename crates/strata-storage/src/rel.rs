//! The relation: one table's pages, trees, and MVCC handles.

use std::path::Path;
use std::sync::Arc;

use strata_common::constants::MAX_COLUMNS;
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::BlockNumber;
use strata_common::EngineConfig;
use strata_mvcc::{TransactionManager, UndoLog};

use crate::buffer::BufferPool;
use crate::meta;
use crate::table::ColumnMeta;

/// A columnar table: the buffer pool holding its pages, its column
/// metadata, and the MVCC state (undo log, transaction manager) its
/// visibility decisions run against.
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use strata_common::EngineConfig;
/// use strata_storage::{ColumnMeta, Relation};
///
/// let rel = Relation::create(
///     vec![ColumnMeta::new("id"), ColumnMeta::new("name")],
///     EngineConfig::default(),
/// ).unwrap();
///
/// let txn = rel.transactions().begin();
/// let tid = rel
///     .insert_row(&txn, &[Some(Bytes::from("1")), Some(Bytes::from("ada"))])
///     .unwrap();
/// rel.transactions().commit(txn.xid()).unwrap();
///
/// let snapshot = rel.transactions().snapshot_now();
/// let row = rel.fetch_row(&snapshot, tid).unwrap().unwrap();
/// assert_eq!(row[1], Some(Bytes::from("ada")));
/// ```
#[derive(Debug)]
pub struct Relation {
    pool: BufferPool,
    columns: Vec<ColumnMeta>,
    undo: Arc<UndoLog>,
    txns: Arc<TransactionManager>,
    config: EngineConfig,
}

impl Relation {
    /// Creates an in-memory relation.
    pub fn create(columns: Vec<ColumnMeta>, config: EngineConfig) -> StrataResult<Self> {
        Self::build(BufferPool::new_in_memory(), columns, config)
    }

    /// Creates a relation backed by a fresh file.
    pub fn create_at(
        path: impl AsRef<Path>,
        columns: Vec<ColumnMeta>,
        config: EngineConfig,
    ) -> StrataResult<Self> {
        Self::build(BufferPool::create(path)?, columns, config)
    }

    fn build(
        pool: BufferPool,
        columns: Vec<ColumnMeta>,
        config: EngineConfig,
    ) -> StrataResult<Self> {
        if columns.is_empty() || columns.len() > MAX_COLUMNS {
            return Err(StrataError::invalid_argument(format!(
                "a relation needs between 1 and {MAX_COLUMNS} columns"
            )));
        }
        let metabuf = pool.allocate()?;
        debug_assert_eq!(metabuf.block(), BlockNumber::METAPAGE);
        {
            let mut guard = metabuf.write();
            meta::init_metapage(guard.as_mut_slice(), columns.len() as u32);
        }
        metabuf.mark_dirty();

        Ok(Self {
            pool,
            columns,
            undo: Arc::new(UndoLog::new()),
            txns: Arc::new(TransactionManager::new()),
            config,
        })
    }

    /// Opens an existing relation file. The column list is the caller's
    /// catalog knowledge and is validated against the metapage.
    pub fn open(
        path: impl AsRef<Path>,
        columns: Vec<ColumnMeta>,
        config: EngineConfig,
    ) -> StrataResult<Self> {
        let pool = BufferPool::open(path)?;
        let metabuf = pool.pin(BlockNumber::METAPAGE)?;
        let (natts, undo_high) = {
            let guard = metabuf.read();
            (meta::metapage_natts(&guard)?, meta::read_undo_high(&guard))
        };
        if natts as usize != columns.len() {
            return Err(StrataError::invalid_argument(format!(
                "relation has {natts} columns, caller expected {}",
                columns.len()
            )));
        }
        // Undo pointers persisted on items must read as discarded
        // history, not alias records of the new log.
        Ok(Self {
            pool,
            columns,
            undo: Arc::new(UndoLog::with_base(undo_high)),
            txns: Arc::new(TransactionManager::new()),
            config,
        })
    }

    /// Number of user columns.
    #[must_use]
    pub fn natts(&self) -> usize {
        self.columns.len()
    }

    /// The column metadata.
    #[must_use]
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The transaction manager backing this relation.
    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    /// The undo log backing this relation.
    #[must_use]
    pub fn undo(&self) -> &UndoLog {
        &self.undo
    }

    /// Number of blocks in the relation (including the metapage).
    #[must_use]
    pub fn nblocks(&self) -> u32 {
        self.pool.nblocks()
    }

    /// Writes dirty pages (with checksums) to the backing file, stamping
    /// the undo high-water mark into the metapage first.
    pub fn flush(&self) -> StrataResult<()> {
        let metabuf = self.pool.pin(BlockNumber::METAPAGE)?;
        {
            let mut guard = metabuf.write();
            meta::write_undo_high(guard.as_mut_slice(), self.undo.high_water());
        }
        metabuf.mark_dirty();
        self.pool.flush()
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn txns(&self) -> &TransactionManager {
        &self.txns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_validates_columns() {
        assert!(Relation::create(vec![], EngineConfig::default()).is_err());
        let rel = Relation::create(
            vec![ColumnMeta::new("a"), ColumnMeta::new("b")],
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(rel.natts(), 2);
        assert_eq!(rel.nblocks(), 1);
    }

    #[test]
    fn test_open_validates_column_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel");
        {
            let rel = Relation::create_at(
                &path,
                vec![ColumnMeta::new("a")],
                EngineConfig::default(),
            )
            .unwrap();
            rel.flush().unwrap();
        }
        assert!(Relation::open(
            &path,
            vec![ColumnMeta::new("a"), ColumnMeta::new("b")],
            EngineConfig::default(),
        )
        .is_err());
        assert!(Relation::open(&path, vec![ColumnMeta::new("a")], EngineConfig::default()).is_ok());
    }
}
