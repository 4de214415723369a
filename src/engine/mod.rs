//! Workflow engine state
//!
//! [`WorkflowEngineState`] applies the lifecycle events of workflow instances,
//! in the order the stream processor decided them, to the scope tree and the
//! token counters. Every event is seen twice:
//!
//! - when it is produced (appended to the log), which may create, update or
//!   remove an element instance, or put a new token into a scope
//! - when it is consumed (processed), which takes the token out again
//!
//! A scope can complete once it has no active tokens and no children left.
//!
//! ```text
//! produced:  Initial -> new instance (+1 child on parent)
//!            Intermediate -> update in place
//!            Final -> remove instance (-1 child, +1 token on parent)
//!            Token -> +1 token on scope
//! consumed:  Token, or Final below the root -> -1 token on scope
//! ```

pub mod intent;
pub mod metrics;

pub use intent::{LifecycleCategory, WorkflowInstanceIntent};
pub use metrics::WorkflowInstanceMetrics;

use crate::config::StateConfig;
use crate::error::Result;
use crate::record::WorkflowInstanceRecord;
use crate::state::{IndexedRecord, ModelTransformer, Purpose, WorkflowState};
use prometheus::Registry;
use slog::{debug, o, trace, Logger};

pub struct WorkflowEngineState<T: ModelTransformer> {
    state: WorkflowState<T>,
    metrics: WorkflowInstanceMetrics,
    logger: Logger,
}

impl<T: ModelTransformer> WorkflowEngineState<T> {
    pub fn new(state: WorkflowState<T>, metrics: WorkflowInstanceMetrics, logger: Logger) -> Self {
        Self {
            state,
            metrics,
            logger,
        }
    }

    /// Open the store from `config` and register metrics on `registry`
    pub fn open(config: &StateConfig, transformer: T, registry: &Registry, logger: Logger) -> Result<Self> {
        let metrics = WorkflowInstanceMetrics::new(registry, &config.metrics_prefix)?;
        let state = WorkflowState::open(config, transformer, logger.new(o!("module" => "state")))?;
        Ok(Self::new(state, metrics, logger))
    }

    pub fn state(&self) -> &WorkflowState<T> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut WorkflowState<T> {
        &mut self.state
    }

    pub fn metrics(&self) -> &WorkflowInstanceMetrics {
        &self.metrics
    }

    /// Apply an event that was appended to the log
    pub fn on_event_produced(
        &mut self,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        trace!(self.logger, "Event produced"; "key" => key, "intent" => ?intent);
        match intent.category() {
            LifecycleCategory::Initial => self.create_element_instance(key, intent, record)?,
            LifecycleCategory::Intermediate => self.update_element_instance(key, intent, record)?,
            LifecycleCategory::Final => self.remove_element_instance(key, intent, record)?,
            LifecycleCategory::Token => self.spawn_token(record)?,
            LifecycleCategory::PayloadUpdate => {
                // either an element instance or a token, depending on what owns the key
                match self.state.element_instances_mut().get_instance_mut(key)? {
                    Some(instance) => instance.set_value(record.clone()),
                    None => self.spawn_token(record)?,
                }
            }
            LifecycleCategory::Command => {}
        }

        if key == record.workflow_instance_key {
            self.record_metrics(intent);
        }
        Ok(())
    }

    /// Apply an event that was processed
    pub fn on_event_consumed(
        &mut self,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        let is_token = match intent.category() {
            LifecycleCategory::Token => true,
            LifecycleCategory::Final => !record.is_root_scope(),
            LifecycleCategory::PayloadUpdate => self.state.element_instances_mut().get_instance(key)?.is_none(),
            _ => false,
        };
        if is_token {
            self.state
                .element_instances_mut()
                .consume_token(record.scope_instance_key)?;
        }
        Ok(())
    }

    /// Park a token that waits for a join; it stays active in its scope
    pub fn defer_token_event(
        &self,
        scope_key: i64,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        self.store_record(scope_key, key, intent, record, Purpose::DeferredToken)
    }

    /// Park a token suspended by an incident
    pub fn store_failed_token(
        &self,
        scope_key: i64,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        self.store_record(scope_key, key, intent, record, Purpose::FailedToken)
    }

    /// Park a token that reached the end of its flow
    pub fn store_finished_token(
        &self,
        scope_key: i64,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        self.store_record(scope_key, key, intent, record, Purpose::FinishedToken)
    }

    /// Unpark a record
    ///
    /// A deferred token still counts as active, so releasing one consumes it.
    /// Returns whether the record was parked.
    pub fn consume_stored_record(&mut self, scope_key: i64, key: i64, purpose: Purpose) -> Result<bool> {
        let element_instances = self.state.element_instances_mut();
        let removed = element_instances.remove_stored_record(scope_key, key, purpose)?;
        if removed && purpose == Purpose::DeferredToken {
            element_instances.consume_token(scope_key)?;
        }
        Ok(removed)
    }

    /// End of a processing cycle: make the cached instances durable
    pub fn flush_dirty_state(&mut self) -> Result<()> {
        self.state.flush_dirty_state()
    }

    fn create_element_instance(
        &mut self,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        let scope_key = record.scope_instance_key;
        let parent_key = if record.is_root_scope() { None } else { Some(scope_key) };

        self.state
            .element_instances_mut()
            .new_instance(parent_key, key, record.clone(), intent)?;

        let variables = self.state.variables();
        variables.create_scope(key, scope_key)?;
        if parent_key.is_none() && !record.payload.is_empty() {
            variables.set_variables_local_from_document(key, &record.payload)?;
        }
        Ok(())
    }

    fn update_element_instance(
        &mut self,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        match self.state.element_instances_mut().get_instance_mut(key)? {
            Some(instance) => {
                instance.set_state(intent);
                instance.set_value(record.clone());
            }
            None => debug!(self.logger, "Lifecycle update for unknown element instance";
                "key" => key,
                "intent" => ?intent
            ),
        }
        Ok(())
    }

    fn remove_element_instance(
        &mut self,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) -> Result<()> {
        self.state.element_instances_mut().remove_instance(key)?;
        self.state.variables().remove_scope(key)?;

        if !record.is_root_scope() {
            // continuation in the flow scope
            self.spawn_token(record)?;
        }
        debug!(self.logger, "Element instance finished"; "key" => key, "intent" => ?intent);
        Ok(())
    }

    fn spawn_token(&mut self, record: &WorkflowInstanceRecord) -> Result<()> {
        self.state
            .element_instances_mut()
            .spawn_token(record.scope_instance_key)
    }

    fn store_record(
        &self,
        scope_key: i64,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
        purpose: Purpose,
    ) -> Result<()> {
        let indexed = IndexedRecord::new(key, intent, record.clone());
        self.state
            .element_instances()
            .store_token_event(scope_key, &indexed, purpose)
    }

    fn record_metrics(&self, intent: WorkflowInstanceIntent) {
        match intent {
            WorkflowInstanceIntent::ElementReady => self.metrics.workflow_instance_created(),
            WorkflowInstanceIntent::ElementCompleted => self.metrics.workflow_instance_completed(),
            WorkflowInstanceIntent::ElementTerminated => self.metrics.workflow_instance_canceled(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::logging::test_logger;
    use crate::record::NO_SCOPE;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use WorkflowInstanceIntent::*;

    struct NoopTransformer;

    impl ModelTransformer for NoopTransformer {
        type Definition = ();

        fn transform(&self, _bpmn_process_id: &str, _resource: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    const ROOT: i64 = 1;

    fn create_engine() -> WorkflowEngineState<NoopTransformer> {
        let logger = test_logger();
        let state = WorkflowState::new(Arc::new(MemoryDb::new()), NoopTransformer, logger.clone());
        let metrics = WorkflowInstanceMetrics::new(&Registry::new(), "test").unwrap();
        WorkflowEngineState::new(state, metrics, logger)
    }

    fn record(scope: i64) -> WorkflowInstanceRecord {
        WorkflowInstanceRecord::new("order-process", ROOT).with_scope(scope)
    }

    fn instance(engine: &mut WorkflowEngineState<NoopTransformer>, key: i64) -> crate::state::ElementInstance {
        engine
            .state_mut()
            .element_instances_mut()
            .get_instance(key)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_child_completion_leaves_one_continuation_token() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        engine.on_event_produced(2, ElementReady, &record(ROOT)).unwrap();
        assert_eq!(instance(&mut engine, ROOT).child_count(), 1);

        engine.on_event_produced(3, SequenceFlowTaken, &record(2)).unwrap();
        engine.on_event_consumed(3, SequenceFlowTaken, &record(2)).unwrap();
        assert_eq!(instance(&mut engine, 2).active_tokens(), 0);

        let before = instance(&mut engine, ROOT).active_tokens();
        engine.on_event_produced(2, ElementCompleted, &record(ROOT)).unwrap();

        let root = instance(&mut engine, ROOT);
        assert_eq!(root.active_tokens(), before + 1);
        assert_eq!(root.child_count(), 0);

        engine.on_event_consumed(2, ElementCompleted, &record(ROOT)).unwrap();
        assert_eq!(instance(&mut engine, ROOT).pending_work(), 0);
    }

    #[test]
    fn test_intermediate_updates_in_place() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        engine
            .on_event_produced(ROOT, ElementActivated, &record(NO_SCOPE).with_element_id("process"))
            .unwrap();

        let root = instance(&mut engine, ROOT);
        assert_eq!(root.state(), ElementActivated);
        assert_eq!(root.value().element_id, "process");
    }

    #[test]
    fn test_payload_update_is_instance_or_token() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();

        let updated = record(NO_SCOPE).with_payload(vec![0x80]);
        engine.on_event_produced(ROOT, PayloadUpdated, &updated).unwrap();
        let root = instance(&mut engine, ROOT);
        assert_eq!(root.value().payload.as_ref(), &[0x80u8]);
        assert_eq!(root.state(), ElementReady);
        assert_eq!(root.active_tokens(), 0);

        engine.on_event_produced(9, PayloadUpdated, &record(ROOT)).unwrap();
        assert_eq!(instance(&mut engine, ROOT).active_tokens(), 1);
        engine.on_event_consumed(9, PayloadUpdated, &record(ROOT)).unwrap();
        assert_eq!(instance(&mut engine, ROOT).active_tokens(), 0);
    }

    #[test]
    fn test_commands_do_not_touch_state() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        for command in [Create, Cancel, UpdatePayload] {
            engine.on_event_produced(5, command, &record(ROOT)).unwrap();
            engine.on_event_consumed(5, command, &record(ROOT)).unwrap();
        }
        assert_eq!(instance(&mut engine, ROOT).pending_work(), 0);
    }

    #[test]
    fn test_deferred_token_stays_active_until_released() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        engine.on_event_produced(4, SequenceFlowTaken, &record(ROOT)).unwrap();
        engine.defer_token_event(ROOT, 4, SequenceFlowTaken, &record(ROOT)).unwrap();
        assert_eq!(instance(&mut engine, ROOT).active_tokens(), 1);

        assert!(engine.consume_stored_record(ROOT, 4, Purpose::DeferredToken).unwrap());
        assert_eq!(instance(&mut engine, ROOT).active_tokens(), 0);
        assert!(!engine.consume_stored_record(ROOT, 4, Purpose::DeferredToken).unwrap());
        assert_eq!(instance(&mut engine, ROOT).active_tokens(), 0);
    }

    #[test]
    fn test_failed_and_finished_tokens_do_not_change_counters() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        engine.store_failed_token(ROOT, 6, GatewayActivated, &record(ROOT)).unwrap();
        engine.store_finished_token(ROOT, 7, EndEventOccurred, &record(ROOT)).unwrap();

        let element_instances = engine.state().element_instances();
        assert!(element_instances.get_failed_token(ROOT, 6).unwrap().is_some());
        assert_eq!(element_instances.get_finished_tokens(ROOT).unwrap().len(), 1);

        assert!(engine.consume_stored_record(ROOT, 6, Purpose::FailedToken).unwrap());
        assert_eq!(instance(&mut engine, ROOT).active_tokens(), 0);
    }

    #[test]
    fn test_variable_scopes_follow_element_instances() {
        let mut engine = create_engine();
        let payload = rmp_serde::to_vec(&BTreeMap::from([("order", 7i64)])).unwrap();
        engine
            .on_event_produced(ROOT, ElementReady, &record(NO_SCOPE).with_payload(payload))
            .unwrap();
        engine.on_event_produced(2, ElementReady, &record(ROOT)).unwrap();

        let variables = engine.state().variables();
        assert_eq!(variables.get_parent_scope_key(2).unwrap(), Some(ROOT));
        let order: i64 = rmp_serde::from_slice(&variables.get_variable(2, "order").unwrap().unwrap()).unwrap();
        assert_eq!(order, 7);

        engine.on_event_produced(2, ElementCompleted, &record(ROOT)).unwrap();
        engine.on_event_produced(ROOT, ElementCompleted, &record(NO_SCOPE)).unwrap();
        assert!(engine.state().variables().is_empty().unwrap());
    }

    #[test]
    fn test_metrics_count_workflow_instances_only() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        engine.on_event_produced(2, ElementReady, &record(ROOT)).unwrap();
        engine.on_event_produced(2, ElementTerminated, &record(ROOT)).unwrap();
        engine.on_event_produced(ROOT, ElementCompleted, &record(NO_SCOPE)).unwrap();

        assert_eq!(engine.metrics().count("created"), 1);
        assert_eq!(engine.metrics().count("canceled"), 0);
        assert_eq!(engine.metrics().count("completed"), 1);
    }

    #[test]
    fn test_flush_persists_bookkeeping() {
        let mut engine = create_engine();
        engine.on_event_produced(ROOT, ElementReady, &record(NO_SCOPE)).unwrap();
        engine.on_event_produced(3, StartEventOccurred, &record(ROOT)).unwrap();
        engine.flush_dirty_state().unwrap();

        let element_instances = engine.state().element_instances();
        assert_eq!(element_instances.cached_count(), 0);
        let persisted = element_instances.load_persisted_instance(ROOT).unwrap().unwrap();
        assert_eq!(persisted.active_tokens(), 1);
    }
}
