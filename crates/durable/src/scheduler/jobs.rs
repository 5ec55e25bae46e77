//! Reconciliation jobs
//!
//! Each job turns rows whose deadline has passed into state transitions:
//!
//! | Job | Selects | Does |
//! |---|---|---|
//! | `resume_due_pauses` | paused, `resume_at <= now` | dispatch `Resume` |
//! | `timeout_waiting_for_event` | paused on event, `wait_timeout_at <= now` | close subscription, fail |
//! | `retry_failed_steps` | failed step, `next_retry_at <= now` | reset step, dispatch `RetryStep` |
//! | `cleanup_old_executions` | terminal, `created_at < now - retention` | delete with steps and subscriptions |
//! | `reclaim_stale_runs` | running, untouched for `stale_after` | requeue the step or dispatch `Continue` |
//!
//! A job never runs twice at once: an in-process flag guards against an
//! overlapping tick, and a named lease row guards against other processes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::engine::{Dispatch, DispatchCommand, DispatchOutcome, EngineError, Transition};
use crate::events::{EventGateway, MatchedExecution};
use crate::model::{StepStatus, WorkflowExecution};
use crate::persistence::{ExecutionStore, StepPatch, StoreError};

/// The reconciliation jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ResumeDuePauses,
    TimeoutWaitingForEvent,
    RetryFailedSteps,
    CleanupOldExecutions,
    ReclaimStaleRuns,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        Self::ResumeDuePauses,
        Self::TimeoutWaitingForEvent,
        Self::RetryFailedSteps,
        Self::CleanupOldExecutions,
        Self::ReclaimStaleRuns,
    ];

    /// Also the lease name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResumeDuePauses => "resume_due_pauses",
            Self::TimeoutWaitingForEvent => "timeout_waiting_for_event",
            Self::RetryFailedSteps => "retry_failed_steps",
            Self::CleanupOldExecutions => "cleanup_old_executions",
            Self::ReclaimStaleRuns => "reclaim_stale_runs",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::ResumeDuePauses => 0,
            Self::TimeoutWaitingForEvent => 1,
            Self::RetryFailedSteps => 2,
            Self::CleanupOldExecutions => 3,
            Self::ReclaimStaleRuns => 4,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one job run did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job: JobKind,

    /// The run was skipped because another run holds the job
    pub skipped: bool,

    /// Rows selected as due
    pub scanned: usize,

    /// Rows this run changed (dispatched, failed, reset or deleted)
    pub applied: u64,

    /// Rows another actor changed first
    pub raced: usize,

    /// Rows whose handling errored; they stay due for the next run
    pub errors: usize,
}

impl JobReport {
    fn new(job: JobKind) -> Self {
        Self {
            job,
            skipped: false,
            scanned: 0,
            applied: 0,
            raced: 0,
            errors: 0,
        }
    }

    fn skipped(job: JobKind) -> Self {
        Self {
            skipped: true,
            ..Self::new(job)
        }
    }

    pub fn did_work(&self) -> bool {
        self.applied > 0 || self.raced > 0 || self.errors > 0
    }

    fn count_dispatch(&mut self, result: &Result<DispatchOutcome, EngineError>) {
        match result {
            Ok(
                DispatchOutcome::Completed
                | DispatchOutcome::Paused
                | DispatchOutcome::Failed { .. }
                | DispatchOutcome::Cancelled
                | DispatchOutcome::StepRetryScheduled { .. },
            ) => self.applied += 1,
            Ok(_) => self.raced += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Resets an in-flight flag when a run ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Error written on a retry step whose worker went away
pub const STALE_STEP_ERROR: &str = "step abandoned by a lost worker";

enum Expiry {
    Failed,
    Redelivered,
    Raced,
}

enum Reclaim {
    /// Nothing in flight or parked: run the graph again
    Continue,
    /// A stranded retry step was handed back to the retry job
    StepRequeued,
    /// A retry is parked or was just reset; its own job owns it
    Waiting,
    Raced,
}

/// The reconciliation jobs over one store
pub struct ReconciliationJobs {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<dyn Dispatch>,
    gateway: EventGateway,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    holder: String,
    in_flight: [AtomicBool; 5],
}

impl ReconciliationJobs {
    pub fn new(store: Arc<dyn ExecutionStore>, dispatcher: Arc<dyn Dispatch>) -> Self {
        let gateway = EventGateway::new(store.clone(), dispatcher.clone());
        Self {
            store,
            dispatcher,
            gateway,
            clock: Arc::new(SystemClock),
            config: SchedulerConfig::default(),
            holder: format!("scheduler-{}", uuid::Uuid::now_v7()),
            in_flight: Default::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.gateway = self.gateway.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Lease holder name, usually the worker id
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one job by kind, using the configured retention for cleanup
    pub async fn run_job(&self, job: JobKind) -> Result<JobReport, StoreError> {
        match job {
            JobKind::ResumeDuePauses => self.resume_due_pauses().await,
            JobKind::TimeoutWaitingForEvent => self.timeout_waiting_for_event().await,
            JobKind::RetryFailedSteps => self.retry_failed_steps().await,
            JobKind::CleanupOldExecutions => {
                self.cleanup_old_executions(self.config.retention_days)
                    .await
            }
            JobKind::ReclaimStaleRuns => self.reclaim_stale_runs().await,
        }
    }

    /// Dispatch `Resume` for every paused execution whose `resume_at` passed
    #[instrument(skip(self))]
    pub async fn resume_due_pauses(&self) -> Result<JobReport, StoreError> {
        self.exclusive(JobKind::ResumeDuePauses, |mut report| async move {
            let now = self.clock.now();
            let due = self
                .store
                .list_due_pauses(now, self.config.batch_size)
                .await?;
            report.scanned = due.len();

            let commands = due
                .into_iter()
                .map(|execution_id| DispatchCommand::Resume { execution_id });
            for result in self.dispatch_all(commands).await {
                report.count_dispatch(&result);
            }
            Ok(report)
        })
        .await
    }

    /// Fail every execution whose event wait expired
    ///
    /// The active subscription is closed through the same `is_active` gate
    /// the event gateway uses, so an event and the sweep never both win.
    #[instrument(skip(self))]
    pub async fn timeout_waiting_for_event(&self) -> Result<JobReport, StoreError> {
        self.exclusive(JobKind::TimeoutWaitingForEvent, |mut report| async move {
            let now = self.clock.now();
            let expired = self
                .store
                .list_expired_waits(now, self.config.batch_size)
                .await?;
            report.scanned = expired.len();

            for execution in expired {
                match self.expire(&execution, now).await {
                    Ok(Expiry::Failed | Expiry::Redelivered) => report.applied += 1,
                    Ok(Expiry::Raced) => report.raced += 1,
                    Err(err) => {
                        error!(execution_id = %execution.id, %err, "Could not time out event wait");
                        report.errors += 1;
                    }
                }
            }
            Ok(report)
        })
        .await
    }

    /// Reset every step whose retry is due and dispatch `RetryStep`
    #[instrument(skip(self))]
    pub async fn retry_failed_steps(&self) -> Result<JobReport, StoreError> {
        self.exclusive(JobKind::RetryFailedSteps, |mut report| async move {
            let now = self.clock.now();
            let ready = self
                .store
                .list_ready_retries(now, self.config.batch_size)
                .await?;
            report.scanned = ready.len();

            let mut commands = Vec::with_capacity(ready.len());
            for step in ready {
                let patch = StepPatch {
                    status: Some(StepStatus::Running),
                    next_retry_at: Some(None),
                    error: Some(None),
                    ..Default::default()
                };
                match self
                    .store
                    .try_transition_step(step.id, StepStatus::Failed, patch, now)
                    .await
                {
                    Ok(true) => {
                        debug!(step_id = %step.id, retry_count = step.retry_count, "Step reset for retry");
                        commands.push(DispatchCommand::RetryStep {
                            execution_id: step.execution_id,
                            step_id: step.id,
                        });
                    }
                    Ok(false) => report.raced += 1,
                    Err(err) => {
                        // Steps already reset above must still be dispatched
                        error!(step_id = %step.id, %err, "Could not reset step for retry");
                        report.errors += 1;
                    }
                }
            }

            for result in self.dispatch_all(commands).await {
                report.count_dispatch(&result);
            }
            Ok(report)
        })
        .await
    }

    /// Delete terminal executions created more than `retention_days` ago
    #[instrument(skip(self))]
    pub async fn cleanup_old_executions(&self, retention_days: u32) -> Result<JobReport, StoreError> {
        self.exclusive(JobKind::CleanupOldExecutions, |mut report| async move {
            let now = self.clock.now();
            let cutoff = now
                .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let deleted = self.store.delete_terminal_before(cutoff).await?;
            report.applied = deleted;
            if deleted > 0 {
                info!(deleted, %cutoff, "Deleted old executions");
            }
            Ok(report)
        })
        .await
    }

    /// Pick up `running` executions whose worker went away mid-dispatch
    ///
    /// The run loop touches the row before every node, so a row untouched for
    /// `stale_after` has no live owner. A stranded retry step goes back to
    /// `failed` with its retry due now; any other stale run is dispatched
    /// `Continue`.
    #[instrument(skip(self))]
    pub async fn reclaim_stale_runs(&self) -> Result<JobReport, StoreError> {
        self.exclusive(JobKind::ReclaimStaleRuns, |mut report| async move {
            let now = self.clock.now();
            let cutoff = chrono::Duration::from_std(self.config.stale_after)
                .ok()
                .and_then(|stale_after| now.checked_sub_signed(stale_after))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let stale = self
                .store
                .list_stale_runs(cutoff, self.config.batch_size)
                .await?;
            report.scanned = stale.len();

            let mut commands = Vec::new();
            for execution in stale {
                match self.reclaim(&execution, cutoff, now).await {
                    Ok(Reclaim::Continue) => {
                        warn!(execution_id = %execution.id, updated_at = %execution.updated_at, "Reclaiming stale run");
                        commands.push(DispatchCommand::Continue {
                            execution_id: execution.id,
                        });
                    }
                    Ok(Reclaim::StepRequeued) => report.applied += 1,
                    Ok(Reclaim::Waiting) => {}
                    Ok(Reclaim::Raced) => report.raced += 1,
                    Err(err) => {
                        error!(execution_id = %execution.id, %err, "Could not reclaim stale run");
                        report.errors += 1;
                    }
                }
            }

            for result in self.dispatch_all(commands).await {
                report.count_dispatch(&result);
            }
            Ok(report)
        })
        .await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn reclaim(
        &self,
        execution: &WorkflowExecution,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reclaim, StoreError> {
        let steps = self.store.list_steps(execution.id).await?;

        if let Some(step) = steps.iter().find(|s| s.status == StepStatus::Running) {
            if step.updated_at > cutoff {
                return Ok(Reclaim::Waiting);
            }
            let patch = StepPatch {
                status: Some(StepStatus::Failed),
                next_retry_at: Some(Some(now)),
                error: Some(Some(STALE_STEP_ERROR.to_string())),
                ..Default::default()
            };
            if !self
                .store
                .try_transition_step(step.id, StepStatus::Running, patch, now)
                .await?
            {
                return Ok(Reclaim::Raced);
            }
            warn!(execution_id = %execution.id, step_id = %step.id, "Requeued stranded retry step");
            return Ok(Reclaim::StepRequeued);
        }

        if steps
            .iter()
            .any(|s| s.status == StepStatus::Failed && s.next_retry_at.is_some())
        {
            return Ok(Reclaim::Waiting);
        }
        Ok(Reclaim::Continue)
    }

    async fn expire(&self, execution: &WorkflowExecution, now: DateTime<Utc>) -> Result<Expiry, StoreError> {
        let subscriptions = self.store.list_subscriptions(execution.id).await?;

        if let Some(active) = subscriptions.iter().find(|s| s.is_active) {
            if !self.store.deactivate_subscription(active.id, None).await? {
                debug!(execution_id = %execution.id, "Event won the race against the timeout");
                return Ok(Expiry::Raced);
            }
        } else if let Some(latest) = subscriptions.last().filter(|s| s.is_matched()) {
            // Matched but never resumed: finish the delivery instead of failing
            return match self.gateway.redeliver(latest).await {
                Some(MatchedExecution {
                    outcome: Some(DispatchOutcome::NotFound),
                    ..
                }) => self.abandon_undeliverable(execution, now).await,
                Some(_) => Ok(Expiry::Redelivered),
                None => Ok(Expiry::Raced),
            };
        }

        let event_type = execution.wait_event_type.as_deref().unwrap_or_default();
        if Transition::time_out(event_type, now)
            .apply(self.store.as_ref(), execution.id, now)
            .await?
        {
            warn!(execution_id = %execution.id, %event_type, "Event wait timed out");
            Ok(Expiry::Failed)
        } else {
            Ok(Expiry::Raced)
        }
    }

    /// The matched event can never resume this execution (its definition is
    /// gone), so end the wait instead of redelivering every tick
    async fn abandon_undeliverable(
        &self,
        execution: &WorkflowExecution,
        now: DateTime<Utc>,
    ) -> Result<Expiry, StoreError> {
        let error = format!(
            "matched event could not be delivered: workflow definition {} not found",
            execution.workflow_id
        );
        match Transition::abandon_wait(error, now)
            .apply(self.store.as_ref(), execution.id, now)
            .await
        {
            Ok(true) => {
                warn!(execution_id = %execution.id, "Abandoned undeliverable event wait");
                Ok(Expiry::Failed)
            }
            Ok(false) | Err(StoreError::ExecutionNotFound(_)) => Ok(Expiry::Raced),
            Err(err) => Err(err),
        }
    }

    async fn dispatch_all(
        &self,
        commands: impl IntoIterator<Item = DispatchCommand>,
    ) -> Vec<Result<DispatchOutcome, EngineError>> {
        stream::iter(commands)
            .map(|command| {
                let dispatcher = self.dispatcher.clone();
                async move {
                    let execution_id = command.execution_id();
                    let result = dispatcher.dispatch(command).await;
                    if let Err(err) = &result {
                        error!(%execution_id, %err, "Scheduled dispatch failed");
                    }
                    result
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await
    }

    /// Run `body` unless this job is already running here or elsewhere
    async fn exclusive<F, Fut>(&self, job: JobKind, body: F) -> Result<JobReport, StoreError>
    where
        F: FnOnce(JobReport) -> Fut,
        Fut: Future<Output = Result<JobReport, StoreError>>,
    {
        let flag = &self.in_flight[job.index()];
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(%job, "Job already running in this process");
            return Ok(JobReport::skipped(job));
        }
        let _in_flight = InFlight(flag);

        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if !self
            .store
            .try_acquire_lease(job.as_str(), &self.holder, self.clock.now(), ttl)
            .await?
        {
            debug!(%job, "Job lease held by another process");
            return Ok(JobReport::skipped(job));
        }

        let result = body(JobReport::new(job)).await;

        if let Err(err) = self.store.release_lease(job.as_str(), &self.holder).await {
            warn!(%job, %err, "Could not release job lease");
        }
        result
    }
}
