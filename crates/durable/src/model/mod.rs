//! Persisted rows and the collaborator-facing definition type
//!
//! - [`WorkflowExecution`] - one run of a definition
//! - [`WorkflowExecutionStep`] - one visited node
//! - [`WorkflowEventSubscription`] - one pending wait for an external event

mod execution;
mod step;
mod subscription;

pub use execution::{ExecutionStatus, WorkflowExecution};
pub use step::{StepStatus, WorkflowExecutionStep};
pub use subscription::{
    EventFilter, NewSubscription, SubscriptionMatch, WorkflowEventSubscription,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow definition as supplied by the definition collaborator
///
/// The graph is opaque to the engine; only the node executor reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub graph: serde_json::Value,
}
