//! HTTP surface: event ingestion and execution control

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flowline_durable::events::{supported_events, SupportedEvent};
use flowline_durable::{
    Dispatch, DispatchCommand, DispatchOutcome, EngineError, EventGateway, EventReport,
    ExecutionRunner, ExecutionStore, StoreError, WorkflowEventSubscription, WorkflowExecution,
    WorkflowExecutionStep,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared handles for the routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ExecutionStore>,
    pub runner: Arc<ExecutionRunner>,
    pub dispatcher: Arc<dyn Dispatch>,
    pub gateway: Arc<EventGateway>,
}

/// Standard error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error mapped to a status code
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::DefinitionNotFound(_) | EngineError::RecordNotFound(_) => {
                Self::NotFound(err.to_string())
            }
            EngineError::Store(StoreError::ExecutionNotFound(_)) => Self::NotFound(err.to_string()),
            EngineError::Store(StoreError::Conflict(_)) => Self::Conflict(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        EngineError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(message) => {
                tracing::error!(error = %message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Response wrapper for list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestEventRequest {
    pub workspace_id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateExecutionRequest {
    pub workflow_id: Uuid,
    #[serde(default)]
    pub record_id: Option<Uuid>,
    #[serde(default)]
    pub trigger: serde_json::Value,
    /// Start immediately (default) or leave the row pending
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateExecutionResponse {
    pub execution: WorkflowExecution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DispatchOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowExecutionStep>,
    pub subscriptions: Vec<WorkflowEventSubscription>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Create the router with every route
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events", post(ingest_event))
        .route("/v1/events/supported", get(list_supported_events))
        .route("/v1/executions", post(create_execution))
        .route("/v1/executions/:execution_id", get(get_execution))
        .route("/v1/executions/:execution_id/cancel", post(cancel_execution))
        .route("/v1/executions/:execution_id/resume", post(resume_execution))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /v1/events - Correlate an external event to waiting executions
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(req): Json<IngestEventRequest>,
) -> Result<Json<EventReport>, ApiError> {
    let event_type = req.event_type.trim();
    if event_type.is_empty() {
        return Err(ApiError::BadRequest("event_type is required".to_string()));
    }

    let report = state
        .gateway
        .handle_event(req.workspace_id, event_type, req.payload)
        .await?;

    Ok(Json(report))
}

/// GET /v1/events/supported - Event types workflows can wait for
pub async fn list_supported_events() -> Json<ListResponse<SupportedEvent>> {
    Json(ListResponse {
        data: supported_events().to_vec(),
    })
}

/// POST /v1/executions - Create (and by default start) an execution
pub async fn create_execution(
    State(state): State<AppState>,
    Json(req): Json<CreateExecutionRequest>,
) -> Result<(StatusCode, Json<CreateExecutionResponse>), ApiError> {
    let execution = state
        .runner
        .create_execution(req.workflow_id, req.record_id, req.trigger)
        .await?;

    let outcome = if req.start {
        Some(
            state
                .dispatcher
                .dispatch(DispatchCommand::Start {
                    execution_id: execution.id,
                })
                .await?,
        )
    } else {
        None
    };

    let execution = state.store.get_execution(execution.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateExecutionResponse { execution, outcome }),
    ))
}

/// GET /v1/executions/{execution_id} - Execution with its steps and subscriptions
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let execution = state.store.get_execution(execution_id).await?;
    let steps = state.store.list_steps(execution_id).await?;
    let subscriptions = state.store.list_subscriptions(execution_id).await?;

    Ok(Json(ExecutionDetail {
        execution,
        steps,
        subscriptions,
    }))
}

/// POST /v1/executions/{execution_id}/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let outcome = state
        .dispatcher
        .dispatch(DispatchCommand::Cancel { execution_id })
        .await?;
    control_response(execution_id, outcome)
}

/// POST /v1/executions/{execution_id}/resume - Manual resume of a paused execution
pub async fn resume_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let outcome = state
        .dispatcher
        .dispatch(DispatchCommand::Resume { execution_id })
        .await?;
    control_response(execution_id, outcome)
}

fn control_response(
    execution_id: Uuid,
    outcome: DispatchOutcome,
) -> Result<Json<DispatchOutcome>, ApiError> {
    match outcome {
        DispatchOutcome::NotFound => Err(ApiError::NotFound(format!(
            "execution not found: {execution_id}"
        ))),
        DispatchOutcome::NotPaused { status } => Err(ApiError::Conflict(format!(
            "execution {execution_id} is {status}, not paused"
        ))),
        other => Ok(Json(other)),
    }
}
