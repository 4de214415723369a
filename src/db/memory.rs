//! In-memory ordered store
//!
//! One `BTreeMap` per column family behind a single `RwLock`. Scans copy the
//! matching range in chunks of [`SCAN_CHUNK`] entries and release the lock
//! before invoking the visitor, so visitors can write to the store without
//! deadlocking and an early stop copies at most one chunk.

use super::{BatchOp, ColumnFamily, StateDb, Visitor, WriteBatch};
use crate::error::{Result, StateError};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Keyspace = BTreeMap<Vec<u8>, Vec<u8>>;

/// Entries copied per lock acquisition during a scan
pub const SCAN_CHUNK: usize = 64;

#[derive(Debug, Default)]
pub struct MemoryDb {
    keyspaces: RwLock<HashMap<ColumnFamily, Keyspace>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ColumnFamily, Keyspace>>> {
        self.keyspaces
            .read()
            .map_err(|_| StateError::Db("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ColumnFamily, Keyspace>>> {
        self.keyspaces
            .write()
            .map_err(|_| StateError::Db("memory store lock poisoned".to_string()))
    }

    /// Copy up to [`SCAN_CHUNK`] entries under `prefix`, starting at `lower`
    fn read_chunk(
        &self,
        cf: ColumnFamily,
        prefix: &[u8],
        lower: Bound<Vec<u8>>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let keyspaces = self.read()?;
        Ok(match keyspaces.get(&cf) {
            Some(ks) => ks
                .range((lower, Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .take(SCAN_CHUNK)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => Vec::new(),
        })
    }
}

impl StateDb for MemoryDb {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(&cf).and_then(|ks| ks.get(key).cloned()))
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> Result<()> {
        self.write()?
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> Result<()> {
        if let Some(ks) = self.write()?.get_mut(&cf) {
            ks.remove(key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        // Single write guard for the whole batch makes it atomic for readers
        let mut keyspaces = self.write()?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { cf, key, value } => {
                    keyspaces.entry(cf).or_default().insert(key, value);
                }
                BatchOp::Delete { cf, key } => {
                    if let Some(ks) = keyspaces.get_mut(&cf) {
                        ks.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8], visitor: &mut Visitor<'_>) -> Result<()> {
        let mut lower = Bound::Included(prefix.to_vec());
        loop {
            let chunk = self.read_chunk(cf, prefix, lower)?;
            let Some((last_key, _)) = chunk.last() else {
                return Ok(());
            };
            lower = Bound::Excluded(last_key.clone());
            let exhausted = chunk.len() < SCAN_CHUNK;

            for (key, value) in &chunk {
                if !visitor(key.as_slice(), value.as_slice())? {
                    return Ok(());
                }
            }
            if exhausted {
                return Ok(());
            }
        }
    }
}
