//! Single entry point for running, resuming, cancelling and retrying executions
//!
//! Manual operations, scheduler sweeps and event matches all dispatch through
//! here, so they share one retry envelope and one set of side effects.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::model::ExecutionStatus;
use crate::reliability::{is_transient, RetryPolicy};

use super::runner::{DispatchOutcome, EngineError, ExecutionRunner};

/// Work requested for one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DispatchCommand {
    Start { execution_id: Uuid },
    Resume { execution_id: Uuid },
    Cancel { execution_id: Uuid },
    RetryStep { execution_id: Uuid, step_id: Uuid },

    /// Keep running an execution that is already `running`
    Continue { execution_id: Uuid },
}

impl DispatchCommand {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::Start { execution_id }
            | Self::Resume { execution_id }
            | Self::Cancel { execution_id }
            | Self::RetryStep { execution_id, .. }
            | Self::Continue { execution_id } => *execution_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Resume { .. } => "resume",
            Self::Cancel { .. } => "cancel",
            Self::RetryStep { .. } => "retry_step",
            Self::Continue { .. } => "continue",
        }
    }

    /// Commands that drive the run loop can be retried as `Continue` once
    /// the execution is running
    fn drives_nodes(&self) -> bool {
        !matches!(self, Self::Cancel { .. })
    }
}

/// Something that accepts dispatch commands
///
/// The scheduler and the event gateway only see this trait.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, command: DispatchCommand) -> Result<DispatchOutcome, EngineError>;
}

/// In-process dispatcher with attempt-level retry
///
/// A failed attempt whose message looks transient is retried with backoff;
/// anything else, or running out of attempts, fails the execution with the
/// error recorded verbatim.
pub struct Dispatcher {
    runner: Arc<ExecutionRunner>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(runner: Arc<ExecutionRunner>) -> Self {
        let policy = runner.config().dispatch_retry.clone();
        Self { runner, policy }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn runner(&self) -> &Arc<ExecutionRunner> {
        &self.runner
    }

    async fn attempt(&self, command: &DispatchCommand) -> Result<DispatchOutcome, EngineError> {
        match command {
            DispatchCommand::Start { execution_id } => self.runner.start(*execution_id).await,
            DispatchCommand::Resume { execution_id } => self.runner.resume(*execution_id).await,
            DispatchCommand::Cancel { execution_id } => self.runner.cancel(*execution_id).await,
            DispatchCommand::RetryStep {
                execution_id,
                step_id,
            } => self.runner.retry_step(*execution_id, *step_id).await,
            DispatchCommand::Continue { execution_id } => {
                self.runner.continue_execution(*execution_id).await
            }
        }
    }

    /// Command for the next attempt: `Continue` once the first attempt got
    /// the execution running, otherwise the original command again
    async fn next_command(&self, original: &DispatchCommand) -> DispatchCommand {
        let execution_id = original.execution_id();
        if original.drives_nodes() {
            if let Ok(execution) = self.runner.store().get_execution(execution_id).await {
                if execution.status == ExecutionStatus::Running {
                    return DispatchCommand::Continue { execution_id };
                }
            }
        }
        original.clone()
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    #[instrument(skip(self, command), fields(command = command.name(), execution_id = %command.execution_id()))]
    async fn dispatch(&self, command: DispatchCommand) -> Result<DispatchOutcome, EngineError> {
        let execution_id = command.execution_id();
        let mut current = command.clone();
        let mut attempt = 1;

        loop {
            let err = match self.attempt(&current).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            let message = err.to_string();

            if is_transient(&message) && self.policy.has_attempts_remaining(attempt) {
                attempt += 1;
                let delay = self.policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient dispatch failure, retrying"
                );
                tokio::time::sleep(delay).await;
                current = self.next_command(&command).await;
                continue;
            }

            // Terminal: record the error on the row if it is still running
            match self.runner.fail_execution(execution_id, &message).await {
                Ok(true) => {
                    info!(attempt, "Dispatch failed terminally");
                    return Ok(DispatchOutcome::Failed { error: message });
                }
                Ok(false) => {
                    error!(attempt, error = %message, "Dispatch failed, execution not running");
                    return Err(err);
                }
                Err(fail_err) => {
                    error!(error = %message, %fail_err, "Could not record dispatch failure");
                    return Err(err);
                }
            }
        }
    }
}
