//! Workflow execution rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet started
    Pending,

    /// A worker is driving the execution (or it is parked for a step retry)
    Running,

    /// Suspended until `resume_at` or until a matching event arrives
    Paused,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled by a user
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub const TERMINAL: [ExecutionStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    pub const NON_TERMINAL: [ExecutionStatus; 3] = [Self::Pending, Self::Running, Self::Paused];

    /// Terminal rows are immutable until retention cleanup deletes them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instantiation of a workflow definition, optionally against a business record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub record_id: Option<Uuid>,
    pub status: ExecutionStatus,

    /// Accumulating key-value bag owned by the node executor
    pub context: serde_json::Value,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    /// Time-based wake for pause-for-duration
    pub resume_at: Option<DateTime<Utc>>,

    /// Event type for pause-for-event
    pub wait_event_type: Option<String>,
    pub wait_timeout_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Build a fresh `pending` execution
    pub fn new(
        workflow_id: Uuid,
        record_id: Option<Uuid>,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            record_id,
            status: ExecutionStatus::Pending,
            context,
            started_at: None,
            completed_at: None,
            error: None,
            resume_at: None,
            wait_event_type: None,
            wait_timeout_at: None,
            paused_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the execution is suspended on an external event
    pub fn is_waiting_for_event(&self) -> bool {
        self.status == ExecutionStatus::Paused && self.wait_event_type.is_some()
    }

    /// Check the paused-row invariant: exactly one wake condition while paused
    ///
    /// Non-paused rows always satisfy it.
    pub fn has_consistent_wait_state(&self) -> bool {
        if self.status != ExecutionStatus::Paused {
            return true;
        }
        self.resume_at.is_some() != self.wait_event_type.is_some()
    }
}
