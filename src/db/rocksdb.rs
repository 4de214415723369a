//! RocksDB-backed state store
//!
//! Provides durable storage for every state keyspace using RocksDB. This
//! enables a node to restart and recover its workflow state.
//!
//! # Schema Design
//!
//! One RocksDB column family per [`ColumnFamily`], named after
//! [`ColumnFamily::name`]. Keys are the composite keys produced by
//! [`crate::db::key`], values are the records of [`crate::codec`]. Because
//! RocksDB orders keys bytewise, prefix scans start an iterator at the prefix
//! and stop at the first key that no longer starts with it.

use super::{BatchOp, ColumnFamily, StateDb, Visitor, WriteBatch};
use crate::error::{Result, StateError};
use rocksdb::{ColumnFamily as CfHandle, ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// RocksDB-backed persistent state store
#[derive(Debug, Clone)]
pub struct RocksDbStore {
    /// RocksDB instance
    db: Arc<DB>,

    /// Directory the database was opened from
    path: PathBuf,
}

impl RocksDbStore {
    /// Open the database at `path`, creating missing column families
    ///
    /// # Arguments
    /// * `path` - Path to the RocksDB database directory
    /// * `create_if_missing` - Create the database if the directory is empty
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref();

        let mut opts = Options::default();
        opts.create_if_missing(create_if_missing);
        opts.create_missing_column_families(true);

        let cfs = ColumnFamily::ALL
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.name(), Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Check if a directory already holds a state database
    ///
    /// Helps distinguish a fresh start from a restart.
    pub fn storage_exists<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        if !path.exists() {
            return false;
        }

        let names: Vec<&str> = ColumnFamily::ALL.iter().map(|cf| cf.name()).collect();
        DB::open_cf_for_read_only(&Options::default(), path, names, false).is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self, cf: ColumnFamily) -> Result<&CfHandle> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| StateError::Db(format!("column family '{}' not open", cf.name())))
    }
}

impl StateDb for RocksDbStore {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.handle(cf)?, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put_cf(self.handle(cf)?, key, value)?)
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> Result<()> {
        Ok(self.db.delete_cf(self.handle(cf)?, key)?)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { cf, key, value } => rocks_batch.put_cf(self.handle(cf)?, key, value),
                BatchOp::Delete { cf, key } => rocks_batch.delete_cf(self.handle(cf)?, key),
            }
        }

        // Write batch atomically
        Ok(self.db.write(rocks_batch)?)
    }

    fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8], visitor: &mut Visitor<'_>) -> Result<()> {
        let iter = self
            .db
            .iterator_cf(self.handle(cf)?, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visitor(&key[..], &value[..])? {
                break;
            }
        }
        Ok(())
    }
}
