//! Execution lifecycle and the node run loop
//!
//! The `ExecutionRunner` is responsible for:
//! - Creating executions seeded from a trigger and a record snapshot
//! - The lifecycle transitions (start, resume, cancel, fail)
//! - Driving the node executor until the execution pauses or finishes
//! - Writing one step row per node report, including step retry scheduling

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{deadline_after, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::model::{
    ExecutionStatus, StepStatus, WorkflowDefinition, WorkflowExecution, WorkflowExecutionStep,
};
use crate::persistence::{ExecutionStore, StepPatch, StoreError};
use crate::reliability::is_transient;
use crate::source::{DefinitionSource, RecordSource, SourceError};

use super::node::{NodeError, NodeExecutor, NodeOutcome, NodeReport};
use super::transition::Transition;

/// Errors from engine operations
///
/// Expected no-ops (missing rows, lost races, wrong status) are not errors;
/// they come back as a [`DispatchOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Definition or record lookup failed
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Node executor error that looks transient
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Node reported a failure that looks transient
    #[error("{0}")]
    Transient(String),

    /// Workflow definition does not exist
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),

    /// Business record does not exist
    #[error("record not found: {0}")]
    RecordNotFound(Uuid),
}

/// Result of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The execution finished successfully
    Completed,

    /// The execution paused on a delay or an event
    Paused,

    /// The execution failed terminally
    Failed { error: String },

    /// The execution was cancelled
    Cancelled,

    /// A node failed and will be retried by the scheduler
    StepRetryScheduled {
        step_id: Uuid,
        retry_at: DateTime<Utc>,
    },

    /// Another actor changed the row while this dispatch was running
    Preempted,

    /// Nothing to do, the execution already finished
    AlreadyTerminal { status: ExecutionStatus },

    /// Resume requested on an execution that is not paused
    NotPaused { status: ExecutionStatus },

    /// The execution, its definition or its record does not exist
    NotFound,

    /// Nothing to do for another reason
    Skipped { reason: String },
}

/// Drives executions through their lifecycle
///
/// All state changes go through [`Transition`]s, so two runners working on
/// the same execution (in one process or many) never both apply a change.
///
/// # Example
///
/// ```ignore
/// use flowline_durable::prelude::*;
///
/// let runner = ExecutionRunner::new(store, definitions, records, executor)
///     .with_clock(Arc::new(SystemClock));
///
/// let execution = runner
///     .create_execution(workflow_id, Some(record_id), json!({"source": "form"}))
///     .await?;
/// runner.start(execution.id).await?;
/// ```
pub struct ExecutionRunner {
    store: Arc<dyn ExecutionStore>,
    definitions: Arc<dyn DefinitionSource>,
    records: Arc<dyn RecordSource>,
    executor: Arc<dyn NodeExecutor>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl ExecutionRunner {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        definitions: Arc<dyn DefinitionSource>,
        records: Arc<dyn RecordSource>,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        Self {
            store,
            definitions,
            records,
            executor,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Insert a `pending` execution with context `{trigger, record}`
    #[instrument(skip(self, trigger))]
    pub async fn create_execution(
        &self,
        workflow_id: Uuid,
        record_id: Option<Uuid>,
        trigger: serde_json::Value,
    ) -> Result<WorkflowExecution, EngineError> {
        if self.definitions.get_definition(workflow_id).await?.is_none() {
            return Err(EngineError::DefinitionNotFound(workflow_id));
        }

        let record = match record_id {
            Some(record_id) => self
                .records
                .get_record(record_id)
                .await?
                .ok_or(EngineError::RecordNotFound(record_id))?,
            None => serde_json::Value::Null,
        };

        let context = serde_json::json!({ "trigger": trigger, "record": record });
        let execution = WorkflowExecution::new(workflow_id, record_id, context, self.clock.now());
        self.store.insert_execution(&execution).await?;

        info!(execution_id = %execution.id, %workflow_id, "Created execution");
        Ok(execution)
    }

    /// `pending -> running`, then run nodes
    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let Some(mut execution) = self.load(id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };

        match execution.status {
            ExecutionStatus::Pending => {}
            status if status.is_terminal() => {
                return Ok(DispatchOutcome::AlreadyTerminal { status })
            }
            status => {
                return Ok(DispatchOutcome::Skipped {
                    reason: format!("execution is already {status}"),
                })
            }
        }

        let Some(definition) = self.definitions.get_definition(execution.workflow_id).await?
        else {
            warn!(execution_id = %id, workflow_id = %execution.workflow_id, "Definition missing, not starting");
            return Ok(DispatchOutcome::NotFound);
        };
        if let Some(record_id) = execution.record_id {
            if self.records.get_record(record_id).await?.is_none() {
                warn!(execution_id = %id, %record_id, "Record missing, not starting");
                return Ok(DispatchOutcome::NotFound);
            }
        }

        let now = self.clock.now();
        if !self
            .transition(&mut execution, Transition::start(now), now)
            .await?
        {
            debug!(execution_id = %id, "Lost start race");
            return Ok(DispatchOutcome::Skipped {
                reason: "execution was started concurrently".into(),
            });
        }

        info!(execution_id = %id, "Execution started");
        self.run(execution, &definition).await
    }

    /// `paused -> running`, then run nodes
    ///
    /// Clears every wake condition and closes the active subscription, so a
    /// manual resume of an event wait also ends the wait.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let Some(mut execution) = self.load(id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };
        if execution.status != ExecutionStatus::Paused {
            return Ok(DispatchOutcome::NotPaused {
                status: execution.status,
            });
        }

        let Some(definition) = self.definitions.get_definition(execution.workflow_id).await?
        else {
            warn!(execution_id = %id, workflow_id = %execution.workflow_id, "Definition missing, not resuming");
            return Ok(DispatchOutcome::NotFound);
        };

        let now = self.clock.now();
        if !self
            .transition(&mut execution, Transition::resume(), now)
            .await?
        {
            let status = self.store.get_execution(id).await?.status;
            debug!(execution_id = %id, %status, "Lost resume race");
            return Ok(DispatchOutcome::NotPaused { status });
        }

        info!(execution_id = %id, "Execution resumed");
        self.run(execution, &definition).await
    }

    /// Any non-terminal status to `cancelled`
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let Some(mut execution) = self.load(id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };
        if execution.is_terminal() {
            return Ok(DispatchOutcome::AlreadyTerminal {
                status: execution.status,
            });
        }

        let now = self.clock.now();
        if !self
            .transition(&mut execution, Transition::cancel(now), now)
            .await?
        {
            let status = self.store.get_execution(id).await?.status;
            return Ok(if status.is_terminal() {
                DispatchOutcome::AlreadyTerminal { status }
            } else {
                DispatchOutcome::Skipped {
                    reason: format!("execution changed to {status} during cancel"),
                }
            });
        }

        info!(execution_id = %id, "Execution cancelled");
        Ok(DispatchOutcome::Cancelled)
    }

    /// Run nodes of an execution that is already `running`
    ///
    /// Used when the dispatcher retries an attempt that failed transiently,
    /// and by the stale-run reclaim.
    #[instrument(skip(self))]
    pub async fn continue_execution(&self, id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let Some(execution) = self.load(id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };

        match execution.status {
            ExecutionStatus::Running => {}
            status if status.is_terminal() => {
                return Ok(DispatchOutcome::AlreadyTerminal { status })
            }
            status => {
                return Ok(DispatchOutcome::Skipped {
                    reason: format!("execution is {status}, not running"),
                })
            }
        }

        let Some(definition) = self.definitions.get_definition(execution.workflow_id).await?
        else {
            return Ok(DispatchOutcome::NotFound);
        };

        self.run(execution, &definition).await
    }

    /// Re-run the node of a step the scheduler reset to `running`
    #[instrument(skip(self))]
    pub async fn retry_step(
        &self,
        execution_id: Uuid,
        step_id: Uuid,
    ) -> Result<DispatchOutcome, EngineError> {
        let step = match self.store.get_step(step_id).await {
            Ok(step) => step,
            Err(StoreError::StepNotFound(_)) => return Ok(DispatchOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };
        if step.execution_id != execution_id {
            return Ok(DispatchOutcome::NotFound);
        }
        if step.status != StepStatus::Running {
            return Ok(DispatchOutcome::Skipped {
                reason: format!("step is {}, not running", step.status),
            });
        }

        let Some(execution) = self.load(execution_id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };

        if execution.is_terminal() {
            // Cancelled while parked: settle the step so it is not left running
            let patch = StepPatch {
                status: Some(StepStatus::Failed),
                next_retry_at: Some(None),
                error: Some(Some(format!("execution is {}", execution.status))),
                ..Default::default()
            };
            self.store
                .try_transition_step(step.id, StepStatus::Running, patch, self.clock.now())
                .await?;
            return Ok(DispatchOutcome::AlreadyTerminal {
                status: execution.status,
            });
        }
        if execution.status != ExecutionStatus::Running {
            return Ok(DispatchOutcome::Skipped {
                reason: format!("execution is {}, not running", execution.status),
            });
        }

        let Some(definition) = self.definitions.get_definition(execution.workflow_id).await?
        else {
            return Ok(DispatchOutcome::NotFound);
        };

        info!(
            %execution_id,
            node_id = %step.node_id,
            retry_count = step.retry_count,
            "Retrying step"
        );
        self.run(execution, &definition).await
    }

    /// `running -> failed` with `error` recorded verbatim
    ///
    /// Returns `false` when the execution is no longer running.
    #[instrument(skip(self))]
    pub async fn fail_execution(&self, id: Uuid, error: &str) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let failed = Transition::fail(error, now)
            .apply(self.store.as_ref(), id, now)
            .await?;
        if failed {
            warn!(execution_id = %id, error, "Execution failed");
        }
        Ok(failed)
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    #[instrument(skip(self, execution, definition), fields(execution_id = %execution.id))]
    async fn run(
        &self,
        mut execution: WorkflowExecution,
        definition: &WorkflowDefinition,
    ) -> Result<DispatchOutcome, EngineError> {
        for _ in 0..self.config.max_nodes_per_dispatch {
            // Keeps the row out of the stale-run reclaim while this worker lives
            let now = self.clock.now();
            if !self
                .transition(&mut execution, Transition::heartbeat(), now)
                .await?
            {
                return Ok(self.preempted(&execution));
            }

            let report = match self.executor.execute(&execution, definition).await {
                Ok(report) => report,
                Err(err) => {
                    let message = err.to_string();
                    if is_transient(&message) {
                        warn!(error = %message, "Node executor failed transiently");
                        return Err(EngineError::Node(err));
                    }
                    return self.fail(&mut execution, message, None).await;
                }
            };

            let NodeReport {
                node_id,
                context,
                outcome,
            } = report;
            let now = self.clock.now();

            match outcome {
                NodeOutcome::Continue => {
                    self.complete_step(execution.id, &node_id).await?;
                    if let Some(context) = context {
                        if !self
                            .transition(&mut execution, Transition::checkpoint(context), now)
                            .await?
                        {
                            return Ok(self.preempted(&execution));
                        }
                    }
                    debug!(%node_id, "Node completed, continuing");
                }
                NodeOutcome::PauseUntil { resume_at } => {
                    self.complete_step(execution.id, &node_id).await?;
                    let transition = Transition::pause_until(resume_at, context, now);
                    if !self.transition(&mut execution, transition, now).await? {
                        return Ok(self.preempted(&execution));
                    }
                    info!(%node_id, %resume_at, "Execution paused until deadline");
                    return Ok(DispatchOutcome::Paused);
                }
                NodeOutcome::PauseForEvent {
                    event_type,
                    filter,
                    timeout_at,
                } => {
                    self.complete_step(execution.id, &node_id).await?;
                    let transition = Transition::pause_for_event(
                        definition.workspace_id,
                        event_type.clone(),
                        filter,
                        timeout_at,
                        context,
                        now,
                    );
                    if !self.transition(&mut execution, transition, now).await? {
                        return Ok(self.preempted(&execution));
                    }
                    info!(%node_id, %event_type, %timeout_at, "Execution waiting for event");
                    return Ok(DispatchOutcome::Paused);
                }
                NodeOutcome::Complete => {
                    self.complete_step(execution.id, &node_id).await?;
                    if !self
                        .transition(&mut execution, Transition::complete(context, now), now)
                        .await?
                    {
                        return Ok(self.preempted(&execution));
                    }
                    info!(%node_id, "Execution completed");
                    return Ok(DispatchOutcome::Completed);
                }
                NodeOutcome::Fail { error, retry_step } => {
                    if is_transient(&error) {
                        self.record_failure(execution.id, &node_id, &error, None)
                            .await?;
                        warn!(%node_id, %error, "Node failed transiently");
                        return Err(EngineError::Transient(error));
                    }
                    return self
                        .fail_node(&mut execution, &node_id, context, error, retry_step)
                        .await;
                }
            }
        }

        let error = format!(
            "exceeded {} nodes in one dispatch without pausing or completing",
            self.config.max_nodes_per_dispatch
        );
        self.fail(&mut execution, error, None).await
    }

    /// Schedule a step retry, or fail the execution when none are left
    async fn fail_node(
        &self,
        execution: &mut WorkflowExecution,
        node_id: &str,
        context: Option<serde_json::Value>,
        error: String,
        retry_step: bool,
    ) -> Result<DispatchOutcome, EngineError> {
        let now = self.clock.now();
        let retries_so_far = self
            .current_step(execution.id, node_id)
            .await?
            .map_or(0, |step| step.retry_count);

        if retry_step && retries_so_far < self.config.max_step_retries {
            let retry_at = deadline_after(now, self.config.step_retry.backoff(retries_so_far));
            let Some(step_id) = self
                .record_failure(
                    execution.id,
                    node_id,
                    &error,
                    Some((retries_so_far + 1, retry_at)),
                )
                .await?
            else {
                return Ok(self.preempted(execution));
            };

            if let Some(context) = context {
                if !self
                    .transition(execution, Transition::checkpoint(context), now)
                    .await?
                {
                    return Ok(self.preempted(execution));
                }
            }

            info!(
                %node_id,
                retry_count = retries_so_far + 1,
                %retry_at,
                %error,
                "Step failed, retry scheduled"
            );
            return Ok(DispatchOutcome::StepRetryScheduled { step_id, retry_at });
        }

        self.record_failure(execution.id, node_id, &error, None)
            .await?;
        self.fail(execution, error, context).await
    }

    async fn fail(
        &self,
        execution: &mut WorkflowExecution,
        error: String,
        context: Option<serde_json::Value>,
    ) -> Result<DispatchOutcome, EngineError> {
        let now = self.clock.now();
        let mut transition = Transition::fail(error.clone(), now);
        transition.patch.context = context;

        if !self.transition(execution, transition, now).await? {
            return Ok(self.preempted(execution));
        }
        warn!(execution_id = %execution.id, %error, "Execution failed");
        Ok(DispatchOutcome::Failed { error })
    }

    fn preempted(&self, execution: &WorkflowExecution) -> DispatchOutcome {
        warn!(
            execution_id = %execution.id,
            "Execution changed under the run loop, stopping"
        );
        DispatchOutcome::Preempted
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowExecution>, EngineError> {
        match self.store.get_execution(id).await {
            Ok(execution) => Ok(Some(execution)),
            Err(StoreError::ExecutionNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a transition and mirror it into the local copy on success
    async fn transition(
        &self,
        execution: &mut WorkflowExecution,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let patch = transition.patch.clone();
        let applied = transition
            .apply(self.store.as_ref(), execution.id, now)
            .await?;
        if applied {
            patch.apply_to(execution, now);
        }
        Ok(applied)
    }

    /// Latest unfinished step row of a node
    async fn current_step(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<WorkflowExecutionStep>, StoreError> {
        Ok(self
            .store
            .list_steps(execution_id)
            .await?
            .into_iter()
            .rev()
            .find(|step| step.node_id == node_id && step.status != StepStatus::Completed))
    }

    async fn complete_step(&self, execution_id: Uuid, node_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        match self.current_step(execution_id, node_id).await? {
            Some(step) => {
                let patch = StepPatch {
                    status: Some(StepStatus::Completed),
                    next_retry_at: Some(None),
                    error: Some(None),
                    ..Default::default()
                };
                if !self
                    .store
                    .try_transition_step(step.id, step.status, patch, now)
                    .await?
                {
                    warn!(step_id = %step.id, %node_id, "Step changed concurrently");
                }
            }
            None => {
                let step =
                    WorkflowExecutionStep::new(execution_id, node_id, StepStatus::Completed, now);
                self.store.insert_step(&step).await?;
            }
        }
        Ok(())
    }

    /// Mark a node's step failed, optionally with `(retry_count, next_retry_at)`
    ///
    /// Returns the step id, or `None` if the row changed under us.
    async fn record_failure(
        &self,
        execution_id: Uuid,
        node_id: &str,
        error: &str,
        retry: Option<(u32, DateTime<Utc>)>,
    ) -> Result<Option<Uuid>, StoreError> {
        let now = self.clock.now();
        let (retry_count, next_retry_at) = match retry {
            Some((count, at)) => (Some(count), Some(at)),
            None => (None, None),
        };

        match self.current_step(execution_id, node_id).await? {
            Some(step) => {
                let patch = StepPatch {
                    status: Some(StepStatus::Failed),
                    retry_count,
                    next_retry_at: Some(next_retry_at),
                    error: Some(Some(error.to_string())),
                };
                if self
                    .store
                    .try_transition_step(step.id, step.status, patch, now)
                    .await?
                {
                    Ok(Some(step.id))
                } else {
                    warn!(step_id = %step.id, %node_id, "Step changed concurrently");
                    Ok(None)
                }
            }
            None => {
                let mut step =
                    WorkflowExecutionStep::new(execution_id, node_id, StepStatus::Failed, now);
                step.retry_count = retry_count.unwrap_or(0);
                step.next_retry_at = next_retry_at;
                step.error = Some(error.to_string());
                self.store.insert_step(&step).await?;
                Ok(Some(step.id))
            }
        }
    }
}
