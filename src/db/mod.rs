//! Store substrate
//!
//! The state layer runs on an ordered key-value store split into independent
//! keyspaces (column families). [`StateDb`] is the contract every component
//! consumes: point get/put/delete, atomic batches spanning keyspaces, and
//! ascending prefix iteration with early exit.
//!
//! Two backends are provided:
//! - [`MemoryDb`]: `BTreeMap` per keyspace, used for tests and ephemeral nodes
//! - `RocksDbStore`: one RocksDB column family per keyspace
//!   (requires the `persistent-storage` feature)

pub mod key;
pub mod memory;
#[cfg(feature = "persistent-storage")]
pub mod rocksdb;

pub use key::DbKey;
pub use memory::MemoryDb;
#[cfg(feature = "persistent-storage")]
pub use self::rocksdb::RocksDbStore;

use crate::config::StateConfig;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Keyspaces used by the state layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnFamily {
    /// Global key generator counters
    Key,
    /// Per-process version counters
    WorkflowVersion,
    /// workflow key -> persisted workflow
    WorkflowCache,
    /// (process id, version) -> workflow key
    WorkflowCacheByIdAndVersion,
    /// process id -> latest version
    WorkflowCacheLatestVersion,
    /// deployment keys already applied
    Deployments,
    /// element instance key -> element instance
    ElementInstanceKey,
    /// (parent key, child key) -> nil
    ElementInstanceParentChild,
    /// (scope key, purpose, record key) -> stored record
    StoredInstanceEvents,
    /// (scope key, name) -> MessagePack value
    Variables,
    /// child scope key -> parent scope key
    ElementInstanceChildParent,
    /// owner key -> timer instance
    TimerInstances,
    /// (due date, owner key) -> nil
    TimerDueDates,
    /// scope key -> event scope instance
    EventScope,
    /// (scope key, position) -> event trigger
    EventTrigger,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 15] = [
        ColumnFamily::Key,
        ColumnFamily::WorkflowVersion,
        ColumnFamily::WorkflowCache,
        ColumnFamily::WorkflowCacheByIdAndVersion,
        ColumnFamily::WorkflowCacheLatestVersion,
        ColumnFamily::Deployments,
        ColumnFamily::ElementInstanceKey,
        ColumnFamily::ElementInstanceParentChild,
        ColumnFamily::StoredInstanceEvents,
        ColumnFamily::Variables,
        ColumnFamily::ElementInstanceChildParent,
        ColumnFamily::TimerInstances,
        ColumnFamily::TimerDueDates,
        ColumnFamily::EventScope,
        ColumnFamily::EventTrigger,
    ];

    /// Stable name, used as the RocksDB column family name
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Key => "key",
            ColumnFamily::WorkflowVersion => "workflow_version",
            ColumnFamily::WorkflowCache => "workflow_cache",
            ColumnFamily::WorkflowCacheByIdAndVersion => "workflow_cache_by_id_and_version",
            ColumnFamily::WorkflowCacheLatestVersion => "workflow_cache_latest_version",
            ColumnFamily::Deployments => "deployments",
            ColumnFamily::ElementInstanceKey => "element_instance_key",
            ColumnFamily::ElementInstanceParentChild => "element_instance_parent_child",
            ColumnFamily::StoredInstanceEvents => "stored_instance_events",
            ColumnFamily::Variables => "variables",
            ColumnFamily::ElementInstanceChildParent => "element_instance_child_parent",
            ColumnFamily::TimerInstances => "timer_instances",
            ColumnFamily::TimerDueDates => "timer_due_dates",
            ColumnFamily::EventScope => "event_scope",
            ColumnFamily::EventTrigger => "event_trigger",
        }
    }
}

/// A single operation inside a [`WriteBatch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
}

/// Operations applied atomically across keyspaces
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            cf,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { cf, key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Visitor for ordered scans; return `Ok(false)` to stop iterating
pub type Visitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<bool> + 'a;

/// Ordered key-value store partitioned into column families
///
/// Implementations must iterate keys in ascending byte order. Any error is a
/// store I/O failure and is surfaced unchanged; there are no retries at this
/// layer.
pub trait StateDb: Send + Sync {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> Result<()>;

    /// Apply every operation of the batch atomically
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Visit entries whose key starts with `prefix` in ascending key order
    ///
    /// The visitor may write to the store; implementations iterate over a
    /// consistent view taken when the scan starts.
    fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8], visitor: &mut Visitor<'_>) -> Result<()>;

    /// Visit the whole keyspace in ascending order while the visitor returns true
    fn scan(&self, cf: ColumnFamily, visitor: &mut Visitor<'_>) -> Result<()> {
        self.scan_prefix(cf, &[], visitor)
    }

    fn exists(&self, cf: ColumnFamily, key: &[u8]) -> Result<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    fn is_empty(&self, cf: ColumnFamily) -> Result<bool> {
        let mut empty = true;
        self.scan(cf, &mut |_, _| {
            empty = false;
            Ok(false)
        })?;
        Ok(empty)
    }

    fn count(&self, cf: ColumnFamily) -> Result<usize> {
        let mut count = 0;
        self.scan(cf, &mut |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }
}

/// Open the store described by the configuration
///
/// No path means an in-memory store; a path requires the
/// `persistent-storage` feature.
pub fn open_state_db(config: &StateConfig) -> Result<Arc<dyn StateDb>> {
    match config.db_path.as_deref() {
        None => Ok(Arc::new(MemoryDb::new())),
        Some(path) => open_persistent(path, config.create_if_missing),
    }
}

#[cfg(feature = "persistent-storage")]
fn open_persistent(path: &Path, create_if_missing: bool) -> Result<Arc<dyn StateDb>> {
    Ok(Arc::new(RocksDbStore::open(path, create_if_missing)?))
}

#[cfg(not(feature = "persistent-storage"))]
fn open_persistent(path: &Path, _create_if_missing: bool) -> Result<Arc<dyn StateDb>> {
    Err(crate::error::StateError::Config(format!(
        "cannot open {}: built without the persistent-storage feature",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_family_names_are_unique() {
        let mut names: Vec<&str> = ColumnFamily::ALL.iter().map(|cf| cf.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ColumnFamily::ALL.len());
    }

    #[test]
    fn test_open_in_memory_by_default() {
        let db = open_state_db(&StateConfig::in_memory()).unwrap();
        assert!(db.is_empty(ColumnFamily::Variables).unwrap());
    }

    #[cfg(not(feature = "persistent-storage"))]
    #[test]
    fn test_persistent_path_requires_feature() {
        let result = open_state_db(&StateConfig::persistent("/tmp/raftoral-state-test"));
        assert!(result.is_err());
    }
}
