//! Integration test for workflow state on RocksDB
//!
//! Verifies that flushed element instances, variables, timers and
//! deployments survive closing and reopening the store.

#![cfg(feature = "persistent-storage")]

use prometheus::Registry;
use raftoral_state::db::RocksDbStore;
use raftoral_state::engine::{WorkflowEngineState, WorkflowInstanceIntent};
use raftoral_state::state::{DeploymentResource, ModelTransformer};
use raftoral_state::{Result, StateConfig, TimerInstance, WorkflowInstanceRecord};
use tempfile::TempDir;

struct NameTransformer;

impl ModelTransformer for NameTransformer {
    type Definition = String;

    fn transform(&self, bpmn_process_id: &str, _resource: &[u8]) -> Result<String> {
        Ok(bpmn_process_id.to_string())
    }
}

fn open_engine(config: &StateConfig) -> WorkflowEngineState<NameTransformer> {
    WorkflowEngineState::open(
        config,
        NameTransformer,
        &Registry::new(),
        raftoral_state::logging::discard_logger(),
    )
    .unwrap()
}

#[test]
fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = StateConfig::persistent(temp_dir.path());
    assert!(!RocksDbStore::storage_exists(temp_dir.path()));

    let root = WorkflowInstanceRecord::new("order-process", 1);
    let child = WorkflowInstanceRecord::new("order-process", 1)
        .with_element_id("task")
        .with_scope(1);

    {
        let mut engine = open_engine(&config);
        engine
            .on_event_produced(1, WorkflowInstanceIntent::ElementReady, &root)
            .unwrap();
        engine
            .on_event_produced(2, WorkflowInstanceIntent::ElementReady, &child)
            .unwrap();
        engine
            .on_event_produced(3, WorkflowInstanceIntent::SequenceFlowTaken, &child.clone().with_scope(2))
            .unwrap();
        engine.flush_dirty_state().unwrap();

        let state = engine.state_mut();
        state.variables().set_variable_local_from_value(2, "amount", &42i64).unwrap();
        state
            .timers()
            .put(&TimerInstance {
                key: 9,
                element_instance_key: 2,
                workflow_instance_key: 1,
                workflow_key: 1,
                handler_node_id: "timeout".to_string(),
                due_date: 500,
                repetitions: 1,
            })
            .unwrap();
        state
            .deploy(7, vec![DeploymentResource::new("order-process", "order.bpmn", "<bpmn/>")])
            .unwrap();
    }

    assert!(RocksDbStore::storage_exists(temp_dir.path()));

    let mut engine = open_engine(&config.clone().with_create_if_missing(false));
    let state = engine.state_mut();

    let element_instances = state.element_instances_mut();
    let task = element_instances.get_instance(2).unwrap().unwrap();
    assert_eq!(task.active_tokens(), 1);
    assert_eq!(task.parent_key(), 1);
    assert_eq!(element_instances.get_instance(1).unwrap().unwrap().child_count(), 1);
    let children: Vec<i64> = element_instances.get_children(1).unwrap().iter().map(|c| c.key()).collect();
    assert_eq!(children, vec![2]);
    assert_eq!(task.value().scope_instance_key, 1);

    let amount: i64 =
        rmp_serde::from_slice(&state.variables().get_variable(2, "amount").unwrap().unwrap()).unwrap();
    assert_eq!(amount, 42);
    assert_eq!(state.timers().get(2).unwrap().unwrap().due_date, 500);

    let latest = state
        .workflows_mut()
        .get_latest_workflow_version_by_process_id("order-process")
        .unwrap()
        .unwrap();
    assert_eq!(latest.definition(), "order-process");
    assert!(state.deploy(7, Vec::new()).unwrap().is_none());
}
