//! Component states of a partition
//!
//! Each component owns a group of column families and is the only code that
//! reads or writes them. [`WorkflowState`] bundles them over one store.

pub mod deployment;
pub mod element_instance;
pub mod event_scope;
pub mod instance;
pub mod next_value;
pub mod timer;
pub mod variables;
pub mod workflow_state;

pub use deployment::{
    DeployedWorkflow, DeploymentResource, ModelTransformer, PersistedWorkflow,
    WorkflowPersistenceCache,
};
pub use element_instance::ElementInstanceState;
pub use event_scope::{EventScopeInstance, EventScopeInstanceState, EventTrigger};
pub use instance::{ElementInstance, IndexedRecord, Purpose, StoredRecord};
pub use next_value::NextValueManager;
pub use timer::{TimerInstance, TimerInstanceState};
pub use variables::VariablesState;
pub use workflow_state::WorkflowState;
