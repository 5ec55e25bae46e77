//! Execution step rows (one per visited node)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub const ALL: [StepStatus; 4] = [Self::Pending, Self::Running, Self::Completed, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One visited node of an execution
///
/// `retry_count` counts retries already scheduled for this node. It is
/// bumped when the failure is recorded, so a row whose count reached the cap
/// never gets a `next_retry_at` again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStep {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecutionStep {
    pub fn new(
        execution_id: Uuid,
        node_id: impl Into<String>,
        status: StepStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node_id.into(),
            status,
            retry_count: 0,
            next_retry_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the scheduler should pick this step up at `now`
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }
}
