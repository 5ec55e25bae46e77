//! In-memory implementation of ExecutionStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ExecutionStatus, StepStatus, SubscriptionMatch, WorkflowEventSubscription, WorkflowExecution,
    WorkflowExecutionStep,
};

/// Scheduler lease held in memory
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// All tables behind one lock so compound transitions stay atomic
#[derive(Default)]
struct Tables {
    executions: HashMap<Uuid, WorkflowExecution>,
    steps: HashMap<Uuid, WorkflowExecutionStep>,
    subscriptions: HashMap<Uuid, WorkflowEventSubscription>,
    leases: HashMap<String, Lease>,
}

impl Tables {
    fn close_subscriptions(&mut self, execution_id: Uuid) -> usize {
        let mut closed = 0;
        for subscription in self.subscriptions.values_mut() {
            if subscription.execution_id == execution_id && subscription.is_active {
                subscription.is_active = false;
                closed += 1;
            }
        }
        closed
    }
}

/// In-memory implementation of ExecutionStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use flowline_durable::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryExecutionStore {
    tables: RwLock<Tables>,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Get the number of executions
    pub fn execution_count(&self) -> usize {
        self.tables.read().executions.len()
    }

    /// Get the number of step rows
    pub fn step_count(&self) -> usize {
        self.tables.read().steps.len()
    }

    /// Get the number of subscription rows
    pub fn subscription_count(&self) -> usize {
        self.tables.read().subscriptions.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        tables.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.tables
            .read()
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn try_transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        patch: ExecutionPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let execution = tables
            .executions
            .get(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if !guard.admits(execution) {
            return Ok(false);
        }

        // Validate before mutating anything so a conflict leaves no trace
        if patch.subscribe.is_some()
            && !patch.close_subscriptions
            && tables
                .subscriptions
                .values()
                .any(|s| s.execution_id == id && s.is_active)
        {
            return Err(StoreError::Conflict(format!(
                "execution {id} already has an active subscription"
            )));
        }

        if patch.close_subscriptions {
            tables.close_subscriptions(id);
        }

        if let Some(subscription) = &patch.subscribe {
            let row = subscription.clone().into_row(id, now);
            tables.subscriptions.insert(row.id, row);
        }

        if let Some(execution) = tables.executions.get_mut(&id) {
            patch.apply_to(execution, now);
        }
        Ok(true)
    }

    async fn list_due_pauses(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.read();
        let mut due: Vec<&WorkflowExecution> = tables
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Paused && e.resume_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|e| e.resume_at);
        Ok(due.into_iter().take(limit).map(|e| e.id).collect())
    }

    async fn list_expired_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let tables = self.tables.read();
        let mut expired: Vec<&WorkflowExecution> = tables
            .executions
            .values()
            .filter(|e| {
                e.is_waiting_for_event() && e.wait_timeout_at.is_some_and(|at| at <= now)
            })
            .collect();
        expired.sort_by_key(|e| e.wait_timeout_at);
        Ok(expired.into_iter().take(limit).cloned().collect())
    }

    async fn list_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let tables = self.tables.read();
        let mut stale: Vec<&WorkflowExecution> = tables
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Running && e.updated_at <= cutoff)
            .collect();
        stale.sort_by_key(|e| e.updated_at);
        Ok(stale.into_iter().take(limit).cloned().collect())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let doomed: Vec<Uuid> = tables
            .executions
            .values()
            .filter(|e| e.is_terminal() && e.created_at < cutoff)
            .map(|e| e.id)
            .collect();

        for id in &doomed {
            tables.executions.remove(id);
        }
        tables.steps.retain(|_, s| !doomed.contains(&s.execution_id));
        tables
            .subscriptions
            .retain(|_, s| !doomed.contains(&s.execution_id));

        Ok(doomed.len() as u64)
    }

    async fn insert_step(&self, step: &WorkflowExecutionStep) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.executions.contains_key(&step.execution_id) {
            return Err(StoreError::ExecutionNotFound(step.execution_id));
        }
        tables.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<WorkflowExecutionStep, StoreError> {
        self.tables
            .read()
            .steps
            .get(&id)
            .cloned()
            .ok_or(StoreError::StepNotFound(id))
    }

    async fn list_steps(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionStep>, StoreError> {
        let tables = self.tables.read();
        let mut steps: Vec<WorkflowExecutionStep> = tables
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    async fn try_transition_step(
        &self,
        id: Uuid,
        from: StepStatus,
        patch: StepPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let step = tables
            .steps
            .get_mut(&id)
            .ok_or(StoreError::StepNotFound(id))?;

        if step.status != from {
            return Ok(false);
        }
        patch.apply_to(step, now);
        Ok(true)
    }

    async fn list_ready_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecutionStep>, StoreError> {
        let tables = self.tables.read();
        let mut ready: Vec<&WorkflowExecutionStep> =
            tables.steps.values().filter(|s| s.is_retry_due(now)).collect();
        ready.sort_by_key(|s| s.next_retry_at);
        Ok(ready.into_iter().take(limit).cloned().collect())
    }

    async fn list_active_subscriptions(
        &self,
        workspace_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WorkflowEventSubscription>, StoreError> {
        let tables = self.tables.read();
        let mut active: Vec<WorkflowEventSubscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.is_active && s.workspace_id == workspace_id && s.event_type == event_type)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    async fn list_subscriptions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WorkflowEventSubscription>, StoreError> {
        let tables = self.tables.read();
        let mut subscriptions: Vec<WorkflowEventSubscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.id);
        Ok(subscriptions)
    }

    async fn deactivate_subscription(
        &self,
        id: Uuid,
        matched: Option<SubscriptionMatch>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let Some(subscription) = tables.subscriptions.get_mut(&id) else {
            return Ok(false);
        };

        if !subscription.is_active {
            return Ok(false);
        }

        subscription.is_active = false;
        if let Some(matched) = matched {
            subscription.matched_at = Some(matched.matched_at);
            subscription.matched_event_data = Some(matched.event_data);
        }
        Ok(true)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let available = match tables.leases.get(name) {
            None => true,
            Some(lease) => lease.holder == holder || lease.expires_at <= now,
        };

        if available {
            tables.leases.insert(
                name.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(available)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.leases.get(name).is_some_and(|l| l.holder == holder) {
            tables.leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewSubscription;
    use serde_json::json;

    fn seed_execution(store: &InMemoryExecutionStore, now: DateTime<Utc>) -> Uuid {
        let execution = WorkflowExecution::new(Uuid::now_v7(), None, json!({}), now);
        let id = execution.id;
        let mut tables = store.tables.write();
        tables.executions.insert(id, execution);
        drop(tables);
        id
    }

    #[tokio::test]
    async fn test_try_transition_respects_guard() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let execution = WorkflowExecution::new(Uuid::now_v7(), None, json!({}), now);
        store.insert_execution(&execution).await.unwrap();

        let started = store
            .try_transition(
                execution.id,
                &TransitionGuard::from_status(ExecutionStatus::Pending),
                ExecutionPatch::new().with_status(ExecutionStatus::Running),
                now,
            )
            .await
            .unwrap();
        assert!(started);

        // Second start loses: the row is no longer pending
        let again = store
            .try_transition(
                execution.id,
                &TransitionGuard::from_status(ExecutionStatus::Pending),
                ExecutionPatch::new().with_status(ExecutionStatus::Running),
                now,
            )
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_found() {
        let store = InMemoryExecutionStore::new();
        let result = store
            .try_transition(
                Uuid::now_v7(),
                &TransitionGuard::non_terminal(),
                ExecutionPatch::new(),
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(StoreError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn test_second_active_subscription_is_rejected() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let id = seed_execution(&store, now);

        let subscription = NewSubscription {
            workspace_id: Uuid::now_v7(),
            event_type: "form.submitted".into(),
            event_filter: serde_json::Map::new(),
            timeout_at: now + Duration::hours(1),
        };

        let first = store
            .try_transition(
                id,
                &TransitionGuard::non_terminal(),
                ExecutionPatch::new().with_subscription(subscription.clone()),
                now,
            )
            .await
            .unwrap();
        assert!(first);

        let second = store
            .try_transition(
                id,
                &TransitionGuard::non_terminal(),
                ExecutionPatch::new().with_subscription(subscription),
                now,
            )
            .await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_subscription_only_once() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let id = seed_execution(&store, now);

        store
            .try_transition(
                id,
                &TransitionGuard::non_terminal(),
                ExecutionPatch::new().with_subscription(NewSubscription {
                    workspace_id: Uuid::now_v7(),
                    event_type: "email.opened".into(),
                    event_filter: serde_json::Map::new(),
                    timeout_at: now + Duration::hours(1),
                }),
                now,
            )
            .await
            .unwrap();

        let subscription = store.active_subscription(id).await.unwrap().unwrap();
        let stamp = SubscriptionMatch {
            matched_at: now,
            event_data: json!({"email_id": "X"}),
        };

        assert!(store
            .deactivate_subscription(subscription.id, Some(stamp.clone()))
            .await
            .unwrap());
        assert!(!store
            .deactivate_subscription(subscription.id, None)
            .await
            .unwrap());

        // Match stamp survives the losing writer
        let rows = store.list_subscriptions(id).await.unwrap();
        assert_eq!(rows[0].matched_event_data, Some(json!({"email_id": "X"})));
        assert!(!rows[0].is_active);
    }

    #[tokio::test]
    async fn test_list_stale_runs_oldest_first() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let pending = seed_execution(&store, now - Duration::hours(2));

        let mut running = Vec::new();
        for minutes in [30, 90, 5] {
            let id = seed_execution(&store, now);
            store
                .try_transition(
                    id,
                    &TransitionGuard::from_status(ExecutionStatus::Pending),
                    ExecutionPatch::new().with_status(ExecutionStatus::Running),
                    now - Duration::minutes(minutes),
                )
                .await
                .unwrap();
            running.push(id);
        }

        let stale = store
            .list_stale_runs(now - Duration::minutes(10), 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = stale.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![running[1], running[0]]);
        assert!(!ids.contains(&pending));

        let first = store
            .list_stale_runs(now - Duration::minutes(10), 1)
            .await
            .unwrap();
        assert_eq!(first[0].id, running[1]);
    }

    #[tokio::test]
    async fn test_leases() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let ttl = Duration::seconds(60);

        assert!(store.try_acquire_lease("job", "a", now, ttl).await.unwrap());
        assert!(!store.try_acquire_lease("job", "b", now, ttl).await.unwrap());
        assert!(store.try_acquire_lease("job", "a", now, ttl).await.unwrap());

        // Expired lease can be taken over
        assert!(store
            .try_acquire_lease("job", "b", now + Duration::seconds(61), ttl)
            .await
            .unwrap());

        store.release_lease("job", "a").await.unwrap();
        assert!(!store
            .try_acquire_lease("job", "a", now + Duration::seconds(62), ttl)
            .await
            .unwrap());

        store.release_lease("job", "b").await.unwrap();
        assert!(store.try_acquire_lease("job", "a", now, ttl).await.unwrap());
    }
}
