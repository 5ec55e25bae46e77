//! ExecutionStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::model::{
    ExecutionStatus, NewSubscription, StepStatus, SubscriptionMatch, WorkflowEventSubscription,
    WorkflowExecution, WorkflowExecutionStep,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// A uniqueness rule would be broken (e.g. second active subscription)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Predicate a row must satisfy for a transition to apply
///
/// This is the `WHERE` half of every compare-and-swap the engine performs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionGuard {
    /// Current status must be one of these
    pub statuses: Vec<ExecutionStatus>,

    /// Require `wait_event_type IS NOT NULL`
    pub awaiting_event: bool,
}

impl TransitionGuard {
    pub fn from_status(status: ExecutionStatus) -> Self {
        Self {
            statuses: vec![status],
            awaiting_event: false,
        }
    }

    pub fn non_terminal() -> Self {
        Self {
            statuses: ExecutionStatus::NON_TERMINAL.to_vec(),
            awaiting_event: false,
        }
    }

    /// Paused on an external event
    pub fn awaiting_event() -> Self {
        Self {
            statuses: vec![ExecutionStatus::Paused],
            awaiting_event: true,
        }
    }

    pub fn admits(&self, execution: &WorkflowExecution) -> bool {
        self.statuses.contains(&execution.status)
            && (!self.awaiting_event || execution.wait_event_type.is_some())
    }
}

/// Change to the wait fields of an execution
#[derive(Debug, Clone, PartialEq)]
pub enum WaitChange {
    /// Clear `resume_at`, `wait_event_type`, `wait_timeout_at`, `paused_at`
    Clear,

    /// Pause for a duration
    Until {
        resume_at: DateTime<Utc>,
        paused_at: DateTime<Utc>,
    },

    /// Pause for an event
    ForEvent {
        event_type: String,
        timeout_at: DateTime<Utc>,
        paused_at: DateTime<Utc>,
    },
}

/// Values written by a successful transition
///
/// All fields are applied together or not at all, including the
/// subscription side effects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,

    /// Replace the whole context
    pub context: Option<serde_json::Value>,

    /// Shallow-merge these keys into the context, keeping all others
    pub merge_context: Option<serde_json::Map<String, serde_json::Value>>,

    /// Set `started_at` only if it is still null
    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub wait: Option<WaitChange>,

    /// Open a subscription for this execution in the same transition
    pub subscribe: Option<NewSubscription>,

    /// Deactivate any active subscription of this execution
    pub close_subscriptions: bool,
}

impl ExecutionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_context(mut self, context: Option<serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_merged_context(mut self, keys: serde_json::Map<String, serde_json::Value>) -> Self {
        self.merge_context = Some(keys);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitChange) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_subscription(mut self, subscription: NewSubscription) -> Self {
        self.subscribe = Some(subscription);
        self
    }

    pub fn closing_subscriptions(mut self) -> Self {
        self.close_subscriptions = true;
        self
    }

    /// Apply the patch to an in-memory row (used by the memory store and by
    /// callers that want to mirror a successful transition)
    pub fn apply_to(&self, execution: &mut WorkflowExecution, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(context) = &self.context {
            execution.context = context.clone();
        }
        if let Some(keys) = &self.merge_context {
            merge_object(&mut execution.context, keys);
        }
        if let Some(started_at) = self.started_at {
            execution.started_at.get_or_insert(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            execution.completed_at = Some(completed_at);
        }
        if let Some(error) = &self.error {
            execution.error = Some(error.clone());
        }
        match &self.wait {
            None => {}
            Some(WaitChange::Clear) => {
                execution.resume_at = None;
                execution.wait_event_type = None;
                execution.wait_timeout_at = None;
                execution.paused_at = None;
            }
            Some(WaitChange::Until {
                resume_at,
                paused_at,
            }) => {
                execution.resume_at = Some(*resume_at);
                execution.wait_event_type = None;
                execution.wait_timeout_at = None;
                execution.paused_at = Some(*paused_at);
            }
            Some(WaitChange::ForEvent {
                event_type,
                timeout_at,
                paused_at,
            }) => {
                execution.resume_at = None;
                execution.wait_event_type = Some(event_type.clone());
                execution.wait_timeout_at = Some(*timeout_at);
                execution.paused_at = Some(*paused_at);
            }
        }
        execution.updated_at = now;
    }
}

/// Shallow merge of `keys` into a JSON object (non-objects are replaced)
pub fn merge_object(
    target: &mut serde_json::Value,
    keys: &serde_json::Map<String, serde_json::Value>,
) {
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let Some(object) = target.as_object_mut() {
        for (key, value) in keys {
            object.insert(key.clone(), value.clone());
        }
    }
}

/// Values written by a successful step transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub retry_count: Option<u32>,

    /// `Some(None)` clears the column
    pub next_retry_at: Option<Option<DateTime<Utc>>>,

    /// `Some(None)` clears the column
    pub error: Option<Option<String>>,
}

impl StepPatch {
    pub fn apply_to(&self, step: &mut WorkflowExecutionStep, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            step.status = status;
        }
        if let Some(retry_count) = self.retry_count {
            step.retry_count = retry_count;
        }
        if let Some(next_retry_at) = self.next_retry_at {
            step.next_retry_at = next_retry_at;
        }
        if let Some(error) = &self.error {
            step.error = error.clone();
        }
        step.updated_at = now;
    }
}

/// Store for executions, steps, subscriptions and scheduler leases
///
/// Implementations must be thread-safe. Every state change is a conditional
/// update: methods returning `bool` report whether this caller won.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Insert a new execution row
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    /// Get an execution by id
    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Apply `patch` if the row currently satisfies `guard`
    ///
    /// Returns `false` when the row exists but no longer matches the guard.
    async fn try_transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        patch: ExecutionPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Paused executions whose `resume_at` has passed
    async fn list_due_pauses(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Paused executions whose event wait has expired
    async fn list_expired_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Running executions whose row has not been written since `cutoff`,
    /// oldest first. The run loop touches `updated_at` before every node, so
    /// these are runs whose worker went away.
    async fn list_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Delete terminal executions created before `cutoff`, with their steps
    /// and subscriptions. Returns the number of executions removed.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Step Operations
    // =========================================================================

    async fn insert_step(&self, step: &WorkflowExecutionStep) -> Result<(), StoreError>;

    async fn get_step(&self, id: Uuid) -> Result<WorkflowExecutionStep, StoreError>;

    async fn list_steps(&self, execution_id: Uuid)
        -> Result<Vec<WorkflowExecutionStep>, StoreError>;

    /// Apply `patch` if the step is currently in status `from`
    async fn try_transition_step(
        &self,
        id: Uuid,
        from: StepStatus,
        patch: StepPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Failed steps whose `next_retry_at` has passed
    async fn list_ready_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecutionStep>, StoreError>;

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Active subscriptions for a workspace and event type
    async fn list_active_subscriptions(
        &self,
        workspace_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WorkflowEventSubscription>, StoreError>;

    /// All subscriptions (active and historical) of one execution
    async fn list_subscriptions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WorkflowEventSubscription>, StoreError>;

    /// The active subscription of an execution, if any
    async fn active_subscription(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowEventSubscription>, StoreError> {
        Ok(self
            .list_subscriptions(execution_id)
            .await?
            .into_iter()
            .find(|s| s.is_active))
    }

    /// Flip `is_active` from true to false, stamping the match if given
    ///
    /// Only the caller that observes `true` wins; everyone else gets `false`.
    async fn deactivate_subscription(
        &self,
        id: Uuid,
        matched: Option<SubscriptionMatch>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Scheduler Leases
    // =========================================================================

    /// Acquire (or extend) the named lease if it is free, expired, or ours
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release the named lease if we hold it
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}
