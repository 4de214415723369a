//! Workflow instance lifecycle intents
//!
//! Every applied event carries one intent. The orchestrator never inspects an
//! intent directly; it asks for its [`LifecycleCategory`] and matches on that.

use crate::codec::DecodeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkflowInstanceIntent {
    // Commands
    Create,
    Cancel,
    UpdatePayload,

    // Element instance lifecycle
    ElementReady,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,

    // Token lifecycle
    StartEventOccurred,
    EndEventOccurred,
    SequenceFlowTaken,
    GatewayActivated,
    EventTriggered,

    // Either an element instance or a token, see `LifecycleCategory::PayloadUpdate`
    PayloadUpdated,
}

/// How an intent affects the scope/token index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleCategory {
    /// Creates an element instance
    Initial,
    /// Updates an element instance in place
    Intermediate,
    /// Removes an element instance
    Final,
    /// A transient token that never becomes an element instance
    Token,
    /// Element-instance update if an instance with the event key exists, token otherwise
    PayloadUpdate,
    /// Requests; they are answered with events and never change the index
    Command,
}

impl WorkflowInstanceIntent {
    pub const ALL: [WorkflowInstanceIntent; 15] = [
        WorkflowInstanceIntent::Create,
        WorkflowInstanceIntent::Cancel,
        WorkflowInstanceIntent::UpdatePayload,
        WorkflowInstanceIntent::ElementReady,
        WorkflowInstanceIntent::ElementActivated,
        WorkflowInstanceIntent::ElementCompleting,
        WorkflowInstanceIntent::ElementCompleted,
        WorkflowInstanceIntent::ElementTerminating,
        WorkflowInstanceIntent::ElementTerminated,
        WorkflowInstanceIntent::StartEventOccurred,
        WorkflowInstanceIntent::EndEventOccurred,
        WorkflowInstanceIntent::SequenceFlowTaken,
        WorkflowInstanceIntent::GatewayActivated,
        WorkflowInstanceIntent::EventTriggered,
        WorkflowInstanceIntent::PayloadUpdated,
    ];

    pub fn category(&self) -> LifecycleCategory {
        use WorkflowInstanceIntent::*;
        match self {
            Create | Cancel | UpdatePayload => LifecycleCategory::Command,
            ElementReady => LifecycleCategory::Initial,
            ElementActivated | ElementCompleting | ElementTerminating => {
                LifecycleCategory::Intermediate
            }
            ElementCompleted | ElementTerminated => LifecycleCategory::Final,
            StartEventOccurred | EndEventOccurred | SequenceFlowTaken | GatewayActivated
            | EventTriggered => LifecycleCategory::Token,
            PayloadUpdated => LifecycleCategory::PayloadUpdate,
        }
    }

    pub fn is_final(&self) -> bool {
        self.category() == LifecycleCategory::Final
    }

    /// Stable wire value
    pub fn code(&self) -> u8 {
        use WorkflowInstanceIntent::*;
        match self {
            Create => 0,
            ElementReady => 1,
            ElementActivated => 2,
            ElementCompleting => 3,
            ElementCompleted => 4,
            ElementTerminating => 5,
            ElementTerminated => 6,
            StartEventOccurred => 7,
            EndEventOccurred => 8,
            SequenceFlowTaken => 9,
            GatewayActivated => 10,
            EventTriggered => 11,
            Cancel => 12,
            UpdatePayload => 13,
            PayloadUpdated => 14,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Self::ALL
            .iter()
            .copied()
            .find(|intent| intent.code() == code)
            .ok_or(DecodeError::UnknownTag {
                kind: "workflow instance intent",
                tag: code as u16,
            })
    }
}
