//! Node executor contract
//!
//! The engine never interprets a workflow graph. It hands the execution and
//! its definition to a [`NodeExecutor`], which runs the next node and reports
//! what the engine should do with the execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EventFilter, WorkflowDefinition, WorkflowExecution};

/// Error raised by a node executor instead of a report
///
/// Treated like a non-retryable [`NodeOutcome::Fail`], except that messages
/// that look transient go through the dispatcher's attempt retry.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node ran and failed
    #[error("{0}")]
    Failed(String),

    /// The node could not be reached (network, outbound service)
    #[error("{0}")]
    Transport(String),
}

/// What the engine does after a node ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// More nodes remain; invoke the executor again
    Continue,

    /// Suspend until a wall-clock deadline
    PauseUntil { resume_at: DateTime<Utc> },

    /// Suspend until a matching event arrives or `timeout_at` passes
    PauseForEvent {
        event_type: String,
        #[serde(default)]
        filter: EventFilter,
        timeout_at: DateTime<Utc>,
    },

    /// The workflow finished
    Complete,

    /// The node failed
    ///
    /// With `retry_step` set the node is retried by the scheduler while it
    /// has retries left.
    Fail {
        error: String,
        #[serde(default)]
        retry_step: bool,
    },
}

impl NodeOutcome {
    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            retry_step: false,
        }
    }

    pub fn fail_and_retry(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            retry_step: true,
        }
    }
}

/// Result of running one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node that ran; one step row is written per report
    pub node_id: String,

    /// Replacement context, written atomically with the status change
    #[serde(default)]
    pub context: Option<serde_json::Value>,

    pub outcome: NodeOutcome,
}

impl NodeReport {
    pub fn new(node_id: impl Into<String>, outcome: NodeOutcome) -> Self {
        Self {
            node_id: node_id.into(),
            context: None,
            outcome,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Runs the next node of an execution
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
    ) -> Result<NodeReport, NodeError>;
}
