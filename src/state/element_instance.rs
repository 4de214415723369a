//! Element instance state
//!
//! Tracks the scope tree of every running workflow instance, the number of
//! tokens active in each scope, and records parked against a scope.
//!
//! # Write-back cache
//!
//! Instance creation and every lifecycle or token mutation happen only on the
//! in-memory cache. Nothing reaches the store until [`flush_dirty_state`] runs,
//! once per processing cycle. Removals and parked records go to the store
//! immediately.
//!
//! # Schema
//!
//! - `ElementInstanceKey`: `key` -> [`ElementInstance`]
//! - `ElementInstanceParentChild`: `(parent key, child key)` -> nil
//! - `StoredInstanceEvents`: `(scope key, purpose, record key)` -> [`StoredRecord`]
//!
//! [`flush_dirty_state`]: ElementInstanceState::flush_dirty_state

use crate::codec::{BufferReader, BufferWriter};
use crate::db::key::read_i64_key;
use crate::db::{ColumnFamily, DbKey, StateDb, WriteBatch};
use crate::engine::intent::WorkflowInstanceIntent;
use crate::error::Result;
use crate::record::WorkflowInstanceRecord;
use crate::state::instance::{ElementInstance, IndexedRecord, Purpose, StoredRecord};
use slog::{debug, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Scope tree and token bookkeeping for one partition
///
/// Not thread-safe: owned by the single processing thread of its partition.
pub struct ElementInstanceState {
    db: Arc<dyn StateDb>,

    /// Instances touched since the last flush, keyed by instance key
    cached_instances: BTreeMap<i64, ElementInstance>,

    logger: Logger,
}

impl ElementInstanceState {
    pub fn new(db: Arc<dyn StateDb>, logger: Logger) -> Self {
        Self {
            db,
            cached_instances: BTreeMap::new(),
            logger,
        }
    }

    /// Create an instance in the cache
    ///
    /// The instance is not durable until the next flush. The parent's child
    /// count is incremented right away. If the parent does not exist the
    /// instance is created without a parent link, so no parent-child entry
    /// is ever written for it.
    pub fn new_instance(
        &mut self,
        parent_key: Option<i64>,
        key: i64,
        value: WorkflowInstanceRecord,
        state: WorkflowInstanceIntent,
    ) -> Result<ElementInstance> {
        let parent_key = match parent_key {
            Some(parent_key) => match self.get_instance_mut(parent_key)? {
                Some(parent) => {
                    parent.increment_child_count();
                    Some(parent_key)
                }
                None => {
                    debug!(self.logger, "Parent scope not found for new instance";
                        "key" => key,
                        "parent_key" => parent_key
                    );
                    None
                }
            },
            None => None,
        };

        let instance = ElementInstance::new(key, parent_key, state, value);
        self.cached_instances.insert(key, instance.clone());
        Ok(instance)
    }

    /// Look up an instance, reading through to the store on a cache miss
    pub fn get_instance(&mut self, key: i64) -> Result<Option<ElementInstance>> {
        Ok(self.get_instance_mut(key)?.map(|instance| instance.clone()))
    }

    /// Mutable access to the cached copy of an instance
    ///
    /// Changes made through the reference are written by the next flush.
    pub fn get_instance_mut(&mut self, key: i64) -> Result<Option<&mut ElementInstance>> {
        if !self.cached_instances.contains_key(&key) {
            match self.load_persisted_instance(key)? {
                Some(instance) => {
                    self.cached_instances.insert(key, instance);
                }
                None => return Ok(None),
            }
        }
        Ok(self.cached_instances.get_mut(&key))
    }

    /// Read the durable copy of an instance, bypassing the cache
    pub fn load_persisted_instance(&self, key: i64) -> Result<Option<ElementInstance>> {
        match self.db.get(ColumnFamily::ElementInstanceKey, &key.to_key_bytes()?)? {
            Some(bytes) => Ok(Some(ElementInstance::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn is_cached(&self, key: i64) -> bool {
        self.cached_instances.contains_key(&key)
    }

    pub fn cached_count(&self) -> usize {
        self.cached_instances.len()
    }

    /// Remove an instance, its parent-child link and every record parked under it
    pub fn remove_instance(&mut self, key: i64) -> Result<()> {
        let parent_key = self.get_instance(key)?.map(|instance| instance.parent_key());

        let mut batch = WriteBatch::new();
        batch.delete(ColumnFamily::ElementInstanceKey, key.to_key_bytes()?);
        if let Some(parent_key) = parent_key.filter(|k| *k >= 0) {
            batch.delete(
                ColumnFamily::ElementInstanceParentChild,
                (parent_key, key).to_key_bytes()?,
            );
        }
        self.db
            .scan_prefix(ColumnFamily::StoredInstanceEvents, &key.to_key_bytes()?, &mut |k, _| {
                batch.delete(ColumnFamily::StoredInstanceEvents, k.to_vec());
                Ok(true)
            })?;
        self.db.write_batch(batch)?;

        self.cached_instances.remove(&key);

        if let Some(parent_key) = parent_key.filter(|k| *k >= 0) {
            if let Some(parent) = self.get_instance_mut(parent_key)? {
                parent.decrement_child_count();
            }
        }
        Ok(())
    }

    /// Decrement the active tokens of a scope; no-op if the scope does not exist
    pub fn consume_token(&mut self, scope_key: i64) -> Result<()> {
        match self.get_instance_mut(scope_key)? {
            Some(scope) => {
                if !scope.consume_token() {
                    debug!(self.logger, "No active token left to consume"; "scope_key" => scope_key);
                }
            }
            None => debug!(self.logger, "Consume on unknown scope ignored"; "scope_key" => scope_key),
        }
        Ok(())
    }

    /// Increment the active tokens of a scope; no-op if the scope does not exist
    pub fn spawn_token(&mut self, scope_key: i64) -> Result<()> {
        match self.get_instance_mut(scope_key)? {
            Some(scope) => scope.spawn_token(),
            None => debug!(self.logger, "Spawn on unknown scope ignored"; "scope_key" => scope_key),
        }
        Ok(())
    }

    /// Park a record under `(scope, purpose, record key)`
    pub fn store_token_event(
        &self,
        scope_key: i64,
        record: &IndexedRecord,
        purpose: Purpose,
    ) -> Result<()> {
        let stored = StoredRecord {
            purpose,
            record: record.clone(),
        };
        self.db.put(
            ColumnFamily::StoredInstanceEvents,
            &(scope_key, purpose.code(), record.key).to_key_bytes()?,
            &stored.to_bytes()?,
        )
    }

    /// Unpark a record; returns whether it was parked
    pub fn remove_stored_record(&self, scope_key: i64, key: i64, purpose: Purpose) -> Result<bool> {
        let db_key = (scope_key, purpose.code(), key).to_key_bytes()?;
        if !self.db.exists(ColumnFamily::StoredInstanceEvents, &db_key)? {
            return Ok(false);
        }
        self.db.delete(ColumnFamily::StoredInstanceEvents, &db_key)?;
        Ok(true)
    }

    pub fn get_deferred_tokens(&self, scope_key: i64) -> Result<Vec<IndexedRecord>> {
        self.collect_stored_records(scope_key, Purpose::DeferredToken)
    }

    pub fn get_finished_tokens(&self, scope_key: i64) -> Result<Vec<IndexedRecord>> {
        self.collect_stored_records(scope_key, Purpose::FinishedToken)
    }

    pub fn get_failed_token(&self, scope_key: i64, key: i64) -> Result<Option<IndexedRecord>> {
        let db_key = (scope_key, Purpose::FailedToken.code(), key).to_key_bytes()?;
        match self.db.get(ColumnFamily::StoredInstanceEvents, &db_key)? {
            Some(bytes) => Ok(Some(StoredRecord::from_bytes(&bytes)?.record)),
            None => Ok(None),
        }
    }

    /// Visit failed tokens of a scope in key order until the visitor returns false
    pub fn visit_failed_tokens<F>(&self, scope_key: i64, mut visitor: F) -> Result<()>
    where
        F: FnMut(&IndexedRecord) -> bool,
    {
        self.visit_stored_records(scope_key, Purpose::FailedToken, &mut |record| {
            Ok(visitor(record))
        })
    }

    fn collect_stored_records(&self, scope_key: i64, purpose: Purpose) -> Result<Vec<IndexedRecord>> {
        let mut records = Vec::new();
        self.visit_stored_records(scope_key, purpose, &mut |record| {
            records.push(record.clone());
            Ok(true)
        })?;
        Ok(records)
    }

    fn visit_stored_records(
        &self,
        scope_key: i64,
        purpose: Purpose,
        visitor: &mut dyn FnMut(&IndexedRecord) -> Result<bool>,
    ) -> Result<()> {
        let prefix = (scope_key, purpose.code()).to_key_bytes()?;
        self.db
            .scan_prefix(ColumnFamily::StoredInstanceEvents, &prefix, &mut |_, v| {
                let stored = StoredRecord::from_bytes(v)?;
                visitor(&stored.record)
            })
    }

    /// Children of a scope, ordered by key
    ///
    /// Durable children come from the parent-child index; children created
    /// since the last flush come from the cache.
    pub fn get_children(&mut self, parent_key: i64) -> Result<Vec<ElementInstance>> {
        let mut child_keys = BTreeSet::new();
        self.db.scan_prefix(
            ColumnFamily::ElementInstanceParentChild,
            &parent_key.to_key_bytes()?,
            &mut |k, _| {
                let mut buf = k;
                read_i64_key(&mut buf)?;
                child_keys.insert(read_i64_key(&mut buf)?);
                Ok(true)
            },
        )?;
        child_keys.extend(
            self.cached_instances
                .values()
                .filter(|instance| instance.parent_key() == parent_key)
                .map(|instance| instance.key()),
        );

        let mut children = Vec::with_capacity(child_keys.len());
        for child_key in child_keys {
            if let Some(child) = self.get_instance(child_key)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Write every cached instance to the store in one batch, then clear the cache
    pub fn flush_dirty_state(&mut self) -> Result<()> {
        if self.cached_instances.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for (key, instance) in &self.cached_instances {
            batch.put(
                ColumnFamily::ElementInstanceKey,
                key.to_key_bytes()?,
                instance.to_bytes()?.to_vec(),
            );
            if !instance.is_root() {
                batch.put(
                    ColumnFamily::ElementInstanceParentChild,
                    (instance.parent_key(), *key).to_key_bytes()?,
                    Vec::new(),
                );
            }
        }
        self.db.write_batch(batch)?;

        debug!(self.logger, "Flushed element instances"; "count" => self.cached_instances.len());
        self.cached_instances.clear();
        Ok(())
    }
}
