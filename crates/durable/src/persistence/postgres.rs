//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence using PostgreSQL with:
//! - Compare-and-swap transitions via guarded `UPDATE ... WHERE ... RETURNING`
//! - Subscription side effects applied in the same transaction
//! - Partial unique index enforcing one active subscription per execution
//! - Cascading deletes for retention cleanup

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ExecutionStatus, StepStatus, SubscriptionMatch, WorkflowDefinition, WorkflowEventSubscription,
    WorkflowExecution, WorkflowExecutionStep,
};
use crate::source::{DefinitionSource, SourceError};

const EXECUTION_COLUMNS: &str = r#"
    id, workflow_id, record_id, status, context, started_at, completed_at, error,
    resume_at, wait_event_type, wait_timeout_at, paused_at, created_at, updated_at
"#;

const STEP_COLUMNS: &str = r#"
    id, execution_id, node_id, status, retry_count, next_retry_at, error, created_at, updated_at
"#;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, execution_id, workspace_id, event_type, event_filter, timeout_at, is_active,
    matched_at, matched_event_data, created_at
"#;

/// PostgreSQL implementation of ExecutionStore
///
/// # Example
///
/// ```ignore
/// use flowline_durable::PostgresExecutionStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowline").await?;
/// let store = PostgresExecutionStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == "23505")
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, workflow_id, record_id, status, context, started_at, completed_at, error,
                resume_at, wait_event_type, wait_timeout_at, paused_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.record_id)
        .bind(execution.status.as_str())
        .bind(&execution.context)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.error)
        .bind(execution.resume_at)
        .bind(&execution.wait_event_type)
        .bind(execution.wait_timeout_at)
        .bind(execution.paused_at)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::Conflict(format!("execution {} already exists", execution.id));
            }
            error!("Failed to insert execution: {}", e);
            db_error(e)
        })?;

        debug!(workflow_id = %execution.workflow_id, "inserted execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get execution: {}", e);
            db_error(e)
        })?
        .ok_or(StoreError::ExecutionNotFound(id))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self, guard, patch))]
    async fn try_transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        patch: ExecutionPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let mut query = QueryBuilder::<Postgres>::new("UPDATE workflow_executions SET updated_at = ");
        query.push_bind(now);
        push_patch(&mut query, &patch);

        let statuses: Vec<String> = guard.statuses.iter().map(|s| s.as_str().to_string()).collect();
        query.push(" WHERE id = ").push_bind(id);
        query.push(" AND status = ANY(").push_bind(statuses).push(")");
        if guard.awaiting_event {
            query.push(" AND wait_event_type IS NOT NULL");
        }
        query.push(" RETURNING id");

        let updated = query
            .build()
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to transition execution: {}", e);
                db_error(e)
            })?;

        if updated.is_none() {
            let exists = sqlx::query("SELECT 1 FROM workflow_executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;
            tx.rollback().await.map_err(db_error)?;

            return match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::ExecutionNotFound(id)),
            };
        }

        if patch.close_subscriptions {
            sqlx::query(
                r#"
                UPDATE workflow_event_subscriptions
                SET is_active = FALSE
                WHERE execution_id = $1 AND is_active
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        if let Some(subscription) = patch.subscribe {
            let row = subscription.into_row(id, now);
            sqlx::query(
                r#"
                INSERT INTO workflow_event_subscriptions (
                    id, execution_id, workspace_id, event_type, event_filter, timeout_at,
                    is_active, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7)
                "#,
            )
            .bind(row.id)
            .bind(row.execution_id)
            .bind(row.workspace_id)
            .bind(&row.event_type)
            .bind(serde_json::Value::Object(row.event_filter))
            .bind(row.timeout_at)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "execution {id} already has an active subscription"
                    ))
                } else {
                    db_error(e)
                }
            })?;
        }

        tx.commit().await.map_err(db_error)?;

        debug!(%id, status = ?patch.status, "transitioned execution");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn list_due_pauses(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_executions
            WHERE status = 'paused'
              AND resume_at IS NOT NULL
              AND resume_at <= $1
            ORDER BY resume_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list due pauses: {}", e);
            db_error(e)
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn list_expired_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM workflow_executions
            WHERE status = 'paused'
              AND wait_event_type IS NOT NULL
              AND wait_timeout_at <= $1
            ORDER BY wait_timeout_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list expired waits: {}", e);
            db_error(e)
        })?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM workflow_executions
            WHERE status = 'running'
              AND updated_at <= $1
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list stale runs: {}", e);
            db_error(e)
        })?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // Steps and subscriptions go with their execution (ON DELETE CASCADE)
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_executions
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete old executions: {}", e);
            db_error(e)
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, step), fields(step_id = %step.id))]
    async fn insert_step(&self, step: &WorkflowExecutionStep) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_execution_steps (
                id, execution_id, node_id, status, retry_count, next_retry_at, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(step.id)
        .bind(step.execution_id)
        .bind(&step.node_id)
        .bind(step.status.as_str())
        .bind(step.retry_count as i32)
        .bind(step.next_retry_at)
        .bind(&step.error)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert step: {}", e);
            db_error(e)
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_step(&self, id: Uuid) -> Result<WorkflowExecutionStep, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_execution_steps WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::StepNotFound(id))?;

        step_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_steps(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionStep>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_execution_steps WHERE execution_id = $1 ORDER BY id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, patch))]
    async fn try_transition_step(
        &self,
        id: Uuid,
        from: StepStatus,
        patch: StepPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut query =
            QueryBuilder::<Postgres>::new("UPDATE workflow_execution_steps SET updated_at = ");
        query.push_bind(now);
        if let Some(status) = patch.status {
            query.push(", status = ").push_bind(status.as_str());
        }
        if let Some(retry_count) = patch.retry_count {
            query.push(", retry_count = ").push_bind(retry_count as i32);
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            query.push(", next_retry_at = ").push_bind(next_retry_at);
        }
        if let Some(error) = patch.error {
            query.push(", error = ").push_bind(error);
        }
        query.push(" WHERE id = ").push_bind(id);
        query.push(" AND status = ").push_bind(from.as_str());
        query.push(" RETURNING id");

        let updated = query
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to transition step: {}", e);
                db_error(e)
            })?;

        if updated.is_some() {
            return Ok(true);
        }

        // Distinguish "lost the race" from "no such step"
        self.get_step(id).await.map(|_| false)
    }

    #[instrument(skip(self))]
    async fn list_ready_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecutionStep>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM workflow_execution_steps
            WHERE status = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list ready retries: {}", e);
            db_error(e)
        })?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_active_subscriptions(
        &self,
        workspace_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WorkflowEventSubscription>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM workflow_event_subscriptions
            WHERE workspace_id = $1 AND event_type = $2 AND is_active
            ORDER BY created_at
            "#
        ))
        .bind(workspace_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list active subscriptions: {}", e);
            db_error(e)
        })?;

        rows.iter().map(subscription_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_subscriptions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<WorkflowEventSubscription>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM workflow_event_subscriptions WHERE execution_id = $1 ORDER BY id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(subscription_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn active_subscription(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowEventSubscription>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM workflow_event_subscriptions WHERE execution_id = $1 AND is_active"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    #[instrument(skip(self, matched))]
    async fn deactivate_subscription(
        &self,
        id: Uuid,
        matched: Option<SubscriptionMatch>,
    ) -> Result<bool, StoreError> {
        let (matched_at, event_data) = match matched {
            Some(m) => (Some(m.matched_at), Some(m.event_data)),
            None => (None, None),
        };

        // The is_active predicate is the only gate between racing writers
        let row = sqlx::query(
            r#"
            UPDATE workflow_event_subscriptions
            SET is_active = FALSE,
                matched_at = COALESCE(matched_at, $2),
                matched_event_data = COALESCE(matched_event_data, $3)
            WHERE id = $1 AND is_active
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(matched_at)
        .bind(event_data)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to deactivate subscription: {}", e);
            db_error(e)
        })?;

        debug!(%id, won = row.is_some(), "deactivate subscription");
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    expires_at = EXCLUDED.expires_at
                WHERE scheduler_leases.holder = EXCLUDED.holder
                   OR scheduler_leases.expires_at <= $4
            RETURNING name
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to acquire lease: {}", e);
            db_error(e)
        })?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

/// Definitions read from the `workflow_definitions` table
#[derive(Clone)]
pub struct PostgresDefinitionSource {
    pool: PgPool,
}

impl PostgresDefinitionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionSource for PostgresDefinitionSource {
    #[instrument(skip(self))]
    async fn get_definition(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, SourceError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, graph FROM workflow_definitions WHERE id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(row.map(|row| WorkflowDefinition {
            id: row.get("id"),
            workspace_id: row.get("workspace_id"),
            name: row.get("name"),
            graph: row.get("graph"),
        }))
    }
}

// Helper functions

/// Append the SET clauses of a patch (the statement already has `SET updated_at = $1`)
fn push_patch(query: &mut QueryBuilder<'_, Postgres>, patch: &ExecutionPatch) {
    if let Some(status) = patch.status {
        query.push(", status = ").push_bind(status.as_str());
    }

    match (&patch.context, &patch.merge_context) {
        (Some(context), Some(keys)) => {
            query
                .push(", context = ")
                .push_bind(context.clone())
                .push("::jsonb || ")
                .push_bind(serde_json::Value::Object(keys.clone()))
                .push("::jsonb");
        }
        (Some(context), None) => {
            query.push(", context = ").push_bind(context.clone());
        }
        (None, Some(keys)) => {
            query
                .push(
                    ", context = (CASE WHEN jsonb_typeof(context) = 'object' \
                     THEN context ELSE '{}'::jsonb END) || ",
                )
                .push_bind(serde_json::Value::Object(keys.clone()))
                .push("::jsonb");
        }
        (None, None) => {}
    }

    if let Some(started_at) = patch.started_at {
        query
            .push(", started_at = COALESCE(started_at, ")
            .push_bind(started_at)
            .push(")");
    }
    if let Some(completed_at) = patch.completed_at {
        query.push(", completed_at = ").push_bind(completed_at);
    }
    if let Some(error) = &patch.error {
        query.push(", error = ").push_bind(error.clone());
    }

    match &patch.wait {
        None => {}
        Some(WaitChange::Clear) => {
            query.push(
                ", resume_at = NULL, wait_event_type = NULL, wait_timeout_at = NULL, paused_at = NULL",
            );
        }
        Some(WaitChange::Until {
            resume_at,
            paused_at,
        }) => {
            query
                .push(", resume_at = ")
                .push_bind(*resume_at)
                .push(", wait_event_type = NULL, wait_timeout_at = NULL, paused_at = ")
                .push_bind(*paused_at);
        }
        Some(WaitChange::ForEvent {
            event_type,
            timeout_at,
            paused_at,
        }) => {
            query
                .push(", resume_at = NULL, wait_event_type = ")
                .push_bind(event_type.clone())
                .push(", wait_timeout_at = ")
                .push_bind(*timeout_at)
                .push(", paused_at = ")
                .push_bind(*paused_at);
        }
    }
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowExecution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        record_id: row.get("record_id"),
        status: parse_execution_status(&status)?,
        context: row.get("context"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
        resume_at: row.get("resume_at"),
        wait_event_type: row.get("wait_event_type"),
        wait_timeout_at: row.get("wait_timeout_at"),
        paused_at: row.get("paused_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<WorkflowExecutionStep, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowExecutionStep {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        status: StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("Unknown step status: {}", status)))?,
        retry_count: row.get::<i32, _>("retry_count").max(0) as u32,
        next_retry_at: row.get("next_retry_at"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn subscription_from_row(row: &PgRow) -> Result<WorkflowEventSubscription, StoreError> {
    let filter: serde_json::Value = row.get("event_filter");
    let event_filter = match filter {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(StoreError::Serialization(format!(
                "event_filter must be an object, got {}",
                other
            )))
        }
    };

    Ok(WorkflowEventSubscription {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        workspace_id: row.get("workspace_id"),
        event_type: row.get("event_type"),
        event_filter,
        timeout_at: row.get("timeout_at"),
        is_active: row.get("is_active"),
        matched_at: row.get("matched_at"),
        matched_event_data: row.get("matched_event_data"),
        created_at: row.get("created_at"),
    })
}

fn parse_execution_status(status: &str) -> Result<ExecutionStatus, StoreError> {
    ExecutionStatus::parse(status)
        .ok_or_else(|| StoreError::Database(format!("Unknown execution status: {}", status)))
}
