//! Deployed workflow versions
//!
//! Workflows are append-only: a deployment adds new versions and moves the
//! per-process latest-version pointer, it never rewrites an older version.
//! Lookups go through an in-memory working set of parsed workflows; a miss
//! loads the persisted resource and hands it to the [`ModelTransformer`].
//!
//! # Schema
//!
//! - `WorkflowCache`: `workflow key` -> [`PersistedWorkflow`]
//! - `WorkflowCacheByIdAndVersion`: `(process id, version)` -> workflow key
//! - `WorkflowCacheLatestVersion`: `process id` -> latest version (`i32`)
//! - `Deployments`: `deployment key` -> nil

use crate::codec::{self, BufferReader, BufferWriter, DecodeError, EncodeError};
use crate::db::{ColumnFamily, DbKey, StateDb, WriteBatch};
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use slog::{debug, info, Logger};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A resource of a deployment before it was assigned a key and version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentResource {
    pub bpmn_process_id: String,
    pub resource_name: String,
    pub resource: Bytes,
}

impl DeploymentResource {
    pub fn new(
        bpmn_process_id: impl Into<String>,
        resource_name: impl Into<String>,
        resource: impl Into<Bytes>,
    ) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            resource_name: resource_name.into(),
            resource: resource.into(),
        }
    }
}

/// One stored version of a workflow
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedWorkflow {
    pub key: i64,
    pub version: i32,
    pub bpmn_process_id: String,
    pub resource_name: String,
    pub resource: Bytes,
}

impl PersistedWorkflow {
    pub fn from_resource(key: i64, version: i32, resource: DeploymentResource) -> Self {
        Self {
            key,
            version,
            bpmn_process_id: resource.bpmn_process_id,
            resource_name: resource.resource_name,
            resource: resource.resource,
        }
    }
}

impl BufferWriter for PersistedWorkflow {
    fn encoded_len(&self) -> usize {
        1 + 8
            + 4
            + codec::blob_len(self.bpmn_process_id.as_bytes())
            + codec::blob_len(self.resource_name.as_bytes())
            + codec::blob_len(&self.resource)
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        buf.put_i64(self.key);
        buf.put_i32(self.version);
        codec::put_string(buf, &self.bpmn_process_id)?;
        codec::put_string(buf, &self.resource_name)?;
        codec::put_blob(buf, &self.resource)?;
        Ok(())
    }
}

impl BufferReader for PersistedWorkflow {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        codec::read_version(buf)?;
        Ok(Self {
            key: codec::read_i64(buf)?,
            version: codec::read_i32(buf)?,
            bpmn_process_id: codec::read_string(buf)?,
            resource_name: codec::read_string(buf)?,
            resource: codec::read_blob(buf)?,
        })
    }
}

/// Turns a deployed resource into the definition the engine executes
pub trait ModelTransformer {
    type Definition;

    fn transform(&self, bpmn_process_id: &str, resource: &[u8]) -> Result<Self::Definition>;
}

/// A persisted workflow together with its executable definition
#[derive(Debug)]
pub struct DeployedWorkflow<D> {
    persisted: PersistedWorkflow,
    definition: D,
}

impl<D> DeployedWorkflow<D> {
    pub fn key(&self) -> i64 {
        self.persisted.key
    }

    pub fn version(&self) -> i32 {
        self.persisted.version
    }

    pub fn bpmn_process_id(&self) -> &str {
        &self.persisted.bpmn_process_id
    }

    pub fn resource_name(&self) -> &str {
        &self.persisted.resource_name
    }

    pub fn resource(&self) -> &Bytes {
        &self.persisted.resource
    }

    pub fn persisted(&self) -> &PersistedWorkflow {
        &self.persisted
    }

    pub fn definition(&self) -> &D {
        &self.definition
    }
}

pub struct WorkflowPersistenceCache<T: ModelTransformer> {
    db: Arc<dyn StateDb>,
    transformer: T,

    workflows_by_key: HashMap<i64, Arc<DeployedWorkflow<T::Definition>>>,
    workflows_by_process_id: HashMap<String, BTreeMap<i32, Arc<DeployedWorkflow<T::Definition>>>>,

    logger: Logger,
}

impl<T: ModelTransformer> WorkflowPersistenceCache<T> {
    pub fn new(db: Arc<dyn StateDb>, transformer: T, logger: Logger) -> Self {
        Self {
            db,
            transformer,
            workflows_by_key: HashMap::new(),
            workflows_by_process_id: HashMap::new(),
            logger,
        }
    }

    pub fn is_deployment_applied(&self, deployment_key: i64) -> Result<bool> {
        self.db
            .exists(ColumnFamily::Deployments, &deployment_key.to_key_bytes()?)
    }

    /// Store the workflows of a deployment
    ///
    /// Returns false without touching the store if the deployment key was
    /// already applied. Otherwise every workflow, its `(id, version)` index
    /// entry, the latest-version pointers and the deployment marker are
    /// written in one batch.
    pub fn put_deployment(&mut self, deployment_key: i64, workflows: &[PersistedWorkflow]) -> Result<bool> {
        if self.is_deployment_applied(deployment_key)? {
            debug!(self.logger, "Deployment already applied"; "deployment_key" => deployment_key);
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        let mut latest_versions: HashMap<&str, i32> = HashMap::new();
        for workflow in workflows {
            let process_id = workflow.bpmn_process_id.as_str();
            batch.put(
                ColumnFamily::WorkflowCache,
                workflow.key.to_key_bytes()?,
                workflow.to_bytes()?.to_vec(),
            );
            batch.put(
                ColumnFamily::WorkflowCacheByIdAndVersion,
                (process_id, workflow.version as i64).to_key_bytes()?,
                workflow.key.to_be_bytes().to_vec(),
            );

            let latest = match latest_versions.get(process_id) {
                Some(version) => *version,
                None => self.load_latest_version(process_id)?.unwrap_or(0),
            };
            latest_versions.insert(process_id, latest.max(workflow.version));
        }
        for (process_id, version) in &latest_versions {
            batch.put(
                ColumnFamily::WorkflowCacheLatestVersion,
                process_id.to_key_bytes()?,
                version.to_be_bytes().to_vec(),
            );
        }
        batch.put(ColumnFamily::Deployments, deployment_key.to_key_bytes()?, Vec::new());
        self.db.write_batch(batch)?;

        info!(self.logger, "Deployment applied";
            "deployment_key" => deployment_key,
            "workflows" => workflows.len()
        );
        Ok(true)
    }

    pub fn get_workflow_by_key(&mut self, key: i64) -> Result<Option<Arc<DeployedWorkflow<T::Definition>>>> {
        if let Some(workflow) = self.workflows_by_key.get(&key) {
            return Ok(Some(workflow.clone()));
        }
        match self.load_workflow(key)? {
            Some(persisted) => Ok(Some(self.materialize(persisted)?)),
            None => Ok(None),
        }
    }

    pub fn get_workflow_by_process_id_and_version(
        &mut self,
        bpmn_process_id: &str,
        version: i32,
    ) -> Result<Option<Arc<DeployedWorkflow<T::Definition>>>> {
        let cached = self
            .workflows_by_process_id
            .get(bpmn_process_id)
            .and_then(|versions| versions.get(&version));
        if let Some(workflow) = cached {
            return Ok(Some(workflow.clone()));
        }

        let key = match self.db.get(
            ColumnFamily::WorkflowCacheByIdAndVersion,
            &(bpmn_process_id, version as i64).to_key_bytes()?,
        )? {
            Some(bytes) => codec::decode_i64(&bytes)?,
            None => return Ok(None),
        };
        self.get_workflow_by_key(key)
    }

    /// Highest deployed version of a process
    ///
    /// The pointer is read from the store on every call so a deployment
    /// applied after the working set was filled is always seen.
    pub fn get_latest_workflow_version_by_process_id(
        &mut self,
        bpmn_process_id: &str,
    ) -> Result<Option<Arc<DeployedWorkflow<T::Definition>>>> {
        match self.load_latest_version(bpmn_process_id)? {
            Some(version) => self.get_workflow_by_process_id_and_version(bpmn_process_id, version),
            None => Ok(None),
        }
    }

    /// Every deployed workflow, ordered by key
    pub fn get_workflows(&mut self) -> Result<Vec<Arc<DeployedWorkflow<T::Definition>>>> {
        self.materialize_all()?;
        let mut workflows: Vec<_> = self.workflows_by_key.values().cloned().collect();
        workflows.sort_by_key(|workflow| workflow.key());
        Ok(workflows)
    }

    /// Every deployed version of a process, ordered by version
    pub fn get_workflows_by_process_id(
        &mut self,
        bpmn_process_id: &str,
    ) -> Result<Vec<Arc<DeployedWorkflow<T::Definition>>>> {
        self.materialize_all()?;
        Ok(self
            .workflows_by_process_id
            .get(bpmn_process_id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Number of workflows held in the working set
    pub fn cached_count(&self) -> usize {
        self.workflows_by_key.len()
    }

    fn load_workflow(&self, key: i64) -> Result<Option<PersistedWorkflow>> {
        match self.db.get(ColumnFamily::WorkflowCache, &key.to_key_bytes()?)? {
            Some(bytes) => Ok(Some(PersistedWorkflow::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_latest_version(&self, bpmn_process_id: &str) -> Result<Option<i32>> {
        match self.db.get(
            ColumnFamily::WorkflowCacheLatestVersion,
            &bpmn_process_id.to_key_bytes()?,
        )? {
            Some(bytes) => Ok(Some(codec::decode_i32(&bytes)?)),
            None => Ok(None),
        }
    }

    fn materialize_all(&mut self) -> Result<()> {
        let mut missing = Vec::new();
        self.db.scan(ColumnFamily::WorkflowCache, &mut |_, v| {
            let persisted = PersistedWorkflow::from_bytes(v)?;
            if !self.workflows_by_key.contains_key(&persisted.key) {
                missing.push(persisted);
            }
            Ok(true)
        })?;

        if !missing.is_empty() {
            debug!(self.logger, "Materializing persisted workflows"; "count" => missing.len());
        }
        for persisted in missing {
            self.materialize(persisted)?;
        }
        Ok(())
    }

    fn materialize(&mut self, persisted: PersistedWorkflow) -> Result<Arc<DeployedWorkflow<T::Definition>>> {
        let definition = self
            .transformer
            .transform(&persisted.bpmn_process_id, &persisted.resource)?;
        let workflow = Arc::new(DeployedWorkflow {
            persisted,
            definition,
        });

        self.workflows_by_key.insert(workflow.key(), workflow.clone());
        self.workflows_by_process_id
            .entry(workflow.bpmn_process_id().to_string())
            .or_default()
            .insert(workflow.version(), workflow.clone());
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::error::StateError;
    use crate::logging::test_logger;
    use std::cell::Cell;

    /// Uses the resource text as the definition and counts invocations
    #[derive(Default)]
    struct TextTransformer {
        calls: Cell<usize>,
    }

    impl ModelTransformer for TextTransformer {
        type Definition = String;

        fn transform(&self, bpmn_process_id: &str, resource: &[u8]) -> Result<String> {
            self.calls.set(self.calls.get() + 1);
            String::from_utf8(resource.to_vec()).map_err(|e| StateError::Transform {
                process_id: bpmn_process_id.to_string(),
                reason: e.to_string(),
            })
        }
    }

    fn create_cache() -> WorkflowPersistenceCache<TextTransformer> {
        WorkflowPersistenceCache::new(
            Arc::new(MemoryDb::new()),
            TextTransformer::default(),
            test_logger(),
        )
    }

    fn workflow(key: i64, process_id: &str, version: i32) -> PersistedWorkflow {
        PersistedWorkflow::from_resource(
            key,
            version,
            DeploymentResource::new(process_id, "process.bpmn", format!("{}-v{}", process_id, version)),
        )
    }

    #[test]
    fn test_lookup_by_all_three_indexes() {
        let mut cache = create_cache();
        assert!(cache
            .put_deployment(1, &[workflow(10, "order", 1), workflow(11, "order", 2)])
            .unwrap());

        let by_key = cache.get_workflow_by_key(10).unwrap().unwrap();
        assert_eq!(by_key.definition(), "order-v1");

        let by_version = cache
            .get_workflow_by_process_id_and_version("order", 2)
            .unwrap()
            .unwrap();
        assert_eq!(by_version.key(), 11);

        let latest = cache
            .get_latest_workflow_version_by_process_id("order")
            .unwrap()
            .unwrap();
        assert_eq!(latest.version(), 2);

        assert!(cache.get_workflow_by_key(99).unwrap().is_none());
        assert!(cache
            .get_latest_workflow_version_by_process_id("missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_transform_runs_once_per_workflow() {
        let mut cache = create_cache();
        cache.put_deployment(1, &[workflow(10, "order", 1)]).unwrap();

        cache.get_workflow_by_key(10).unwrap();
        cache.get_workflow_by_process_id_and_version("order", 1).unwrap();
        cache.get_latest_workflow_version_by_process_id("order").unwrap();

        assert_eq!(cache.transformer.calls.get(), 1);
        assert_eq!(cache.cached_count(), 1);
    }

    #[test]
    fn test_duplicate_deployment_is_ignored() {
        let mut cache = create_cache();
        assert!(cache.put_deployment(1, &[workflow(10, "order", 1)]).unwrap());
        assert!(!cache.put_deployment(1, &[workflow(20, "order", 5)]).unwrap());

        assert!(cache.get_workflow_by_key(20).unwrap().is_none());
        assert_eq!(
            cache
                .get_latest_workflow_version_by_process_id("order")
                .unwrap()
                .unwrap()
                .version(),
            1
        );
    }

    #[test]
    fn test_latest_version_never_moves_backwards() {
        let mut cache = create_cache();
        cache.put_deployment(1, &[workflow(10, "order", 3)]).unwrap();
        cache.put_deployment(2, &[workflow(11, "order", 2)]).unwrap();

        let latest = cache
            .get_latest_workflow_version_by_process_id("order")
            .unwrap()
            .unwrap();
        assert_eq!(latest.key(), 10);
    }

    #[test]
    fn test_get_workflows_materializes_everything() {
        let mut cache = create_cache();
        cache
            .put_deployment(1, &[workflow(10, "order", 1), workflow(12, "invoice", 1)])
            .unwrap();
        cache.put_deployment(2, &[workflow(11, "order", 2)]).unwrap();
        assert_eq!(cache.cached_count(), 0);

        let keys: Vec<i64> = cache.get_workflows().unwrap().iter().map(|w| w.key()).collect();
        assert_eq!(keys, vec![10, 11, 12]);

        let versions: Vec<i32> = cache
            .get_workflows_by_process_id("order")
            .unwrap()
            .iter()
            .map(|w| w.version())
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(cache.get_workflows_by_process_id("missing").unwrap().is_empty());
    }

    #[test]
    fn test_transform_failure_is_surfaced() {
        let mut cache = create_cache();
        let invalid = PersistedWorkflow {
            key: 10,
            version: 1,
            bpmn_process_id: "order".to_string(),
            resource_name: "process.bpmn".to_string(),
            resource: Bytes::from_static(&[0xff, 0xfe]),
        };
        cache.put_deployment(1, &[invalid]).unwrap();

        assert!(matches!(
            cache.get_workflow_by_key(10),
            Err(StateError::Transform { .. })
        ));
    }
}
