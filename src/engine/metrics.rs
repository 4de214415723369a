//! Workflow instance metrics

use crate::error::Result;
use prometheus::{IntCounterVec, Opts, Registry};

const CREATED: &str = "created";
const COMPLETED: &str = "completed";
const CANCELED: &str = "canceled";

/// Lifecycle counters of whole workflow instances
///
/// Only events whose key is the workflow instance key are counted, so nested
/// scopes never inflate the numbers.
#[derive(Clone)]
pub struct WorkflowInstanceMetrics {
    /// Workflow instance events by action
    pub events_total: IntCounterVec,
}

impl WorkflowInstanceMetrics {
    /// Create and register the counters on `registry`
    pub fn new(registry: &Registry, prefix: &str) -> Result<Self> {
        let events_total = IntCounterVec::new(
            Opts::new(
                "workflow_instance_events_total",
                "Workflow instance lifecycle events",
            )
            .namespace(prefix),
            &["action"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        Ok(Self { events_total })
    }

    pub fn workflow_instance_created(&self) {
        self.events_total.with_label_values(&[CREATED]).inc();
    }

    pub fn workflow_instance_completed(&self) {
        self.events_total.with_label_values(&[COMPLETED]).inc();
    }

    pub fn workflow_instance_canceled(&self) {
        self.events_total.with_label_values(&[CANCELED]).inc();
    }

    pub fn count(&self, action: &str) -> u64 {
        self.events_total.with_label_values(&[action]).get()
    }
}
