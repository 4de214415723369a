//! Persistent runtime state of Raftoral workflow instances
//!
//! The state layer keeps the queryable projection of every running workflow
//! instance on an ordered key-value store: the element scope tree with its
//! token counters, variables, timers, event scope triggers and the deployed
//! workflow versions. [`WorkflowEngineState`] drives it from the lifecycle
//! events the stream processor applies.

pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod record;
pub mod state;

pub use config::StateConfig;
pub use db::{open_state_db, ColumnFamily, MemoryDb, StateDb, WriteBatch};
pub use engine::{LifecycleCategory, WorkflowEngineState, WorkflowInstanceIntent, WorkflowInstanceMetrics};
pub use error::{Result, StateError};
pub use record::{WorkflowInstanceRecord, NO_SCOPE};
pub use state::{
    DeploymentResource, ElementInstance, ModelTransformer, PersistedWorkflow, Purpose, TimerInstance,
    WorkflowState,
};
