//! All state components of one partition over a single store

use crate::config::StateConfig;
use crate::db::{self, ColumnFamily, DbKey, StateDb};
use crate::error::{Result, StateError};
use crate::state::deployment::{
    DeploymentResource, ModelTransformer, PersistedWorkflow, WorkflowPersistenceCache,
};
use crate::state::element_instance::ElementInstanceState;
use crate::state::event_scope::EventScopeInstanceState;
use crate::state::next_value::NextValueManager;
use crate::state::timer::TimerInstanceState;
use crate::state::variables::VariablesState;
use slog::{o, Logger};
use std::sync::Arc;

const WORKFLOW_KEY_COUNTER: &str = "workflow_key";

pub struct WorkflowState<T: ModelTransformer> {
    db: Arc<dyn StateDb>,
    element_instances: ElementInstanceState,
    variables: VariablesState,
    event_scopes: EventScopeInstanceState,
    timers: TimerInstanceState,
    workflows: WorkflowPersistenceCache<T>,
    next_values: NextValueManager,
}

impl<T: ModelTransformer> WorkflowState<T> {
    pub fn new(db: Arc<dyn StateDb>, transformer: T, logger: Logger) -> Self {
        Self {
            element_instances: ElementInstanceState::new(
                db.clone(),
                logger.new(o!("component" => "element_instances")),
            ),
            variables: VariablesState::new(db.clone(), logger.new(o!("component" => "variables"))),
            event_scopes: EventScopeInstanceState::new(
                db.clone(),
                logger.new(o!("component" => "event_scopes")),
            ),
            timers: TimerInstanceState::new(db.clone(), logger.new(o!("component" => "timers"))),
            workflows: WorkflowPersistenceCache::new(
                db.clone(),
                transformer,
                logger.new(o!("component" => "workflows")),
            ),
            next_values: NextValueManager::new(db.clone()),
            db,
        }
    }

    /// Open the store described by `config` and build the state on top of it
    pub fn open(config: &StateConfig, transformer: T, logger: Logger) -> Result<Self> {
        let db = db::open_state_db(config)?;
        Ok(Self::new(db, transformer, logger))
    }

    pub fn db(&self) -> &Arc<dyn StateDb> {
        &self.db
    }

    pub fn element_instances(&self) -> &ElementInstanceState {
        &self.element_instances
    }

    pub fn element_instances_mut(&mut self) -> &mut ElementInstanceState {
        &mut self.element_instances
    }

    pub fn variables(&self) -> &VariablesState {
        &self.variables
    }

    pub fn event_scopes(&self) -> &EventScopeInstanceState {
        &self.event_scopes
    }

    pub fn timers(&self) -> &TimerInstanceState {
        &self.timers
    }

    pub fn workflows(&self) -> &WorkflowPersistenceCache<T> {
        &self.workflows
    }

    pub fn workflows_mut(&mut self) -> &mut WorkflowPersistenceCache<T> {
        &mut self.workflows
    }

    pub fn next_workflow_key(&self) -> Result<i64> {
        self.next_values
            .get_next_value(ColumnFamily::Key, &WORKFLOW_KEY_COUNTER.to_key_bytes()?)
    }

    pub fn next_workflow_version(&self, bpmn_process_id: &str) -> Result<i32> {
        let version = self
            .next_values
            .get_next_value(ColumnFamily::WorkflowVersion, &bpmn_process_id.to_key_bytes()?)?;
        i32::try_from(version).map_err(|_| StateError::CounterOverflow {
            counter: bpmn_process_id.to_string(),
            value: version,
        })
    }

    /// Assign a key and version to every resource and store the deployment
    ///
    /// Returns `None` if the deployment was already applied; no counter is
    /// advanced in that case.
    pub fn deploy(
        &mut self,
        deployment_key: i64,
        resources: Vec<DeploymentResource>,
    ) -> Result<Option<Vec<PersistedWorkflow>>> {
        if self.workflows.is_deployment_applied(deployment_key)? {
            return Ok(None);
        }

        let mut workflows = Vec::with_capacity(resources.len());
        for resource in resources {
            let key = self.next_workflow_key()?;
            let version = self.next_workflow_version(&resource.bpmn_process_id)?;
            workflows.push(PersistedWorkflow::from_resource(key, version, resource));
        }
        self.workflows.put_deployment(deployment_key, &workflows)?;
        Ok(Some(workflows))
    }

    /// Write the element instances cached during this cycle
    pub fn flush_dirty_state(&mut self) -> Result<()> {
        self.element_instances.flush_dirty_state()
    }
}
