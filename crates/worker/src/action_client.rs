//! HTTP client for the external action service
//!
//! The action service owns the workflow graph: it runs the next node of an
//! execution and reports the outcome. It also serves the business-record
//! snapshots used to seed new executions.

use std::time::Duration;

use async_trait::async_trait;
use flowline_durable::{
    NodeError, NodeExecutor, NodeReport, RecordSource, SourceError, WorkflowDefinition,
    WorkflowExecution,
};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Serialize)]
struct ExecuteNodeRequest<'a> {
    execution: &'a WorkflowExecution,
    definition: &'a WorkflowDefinition,
}

/// `NodeExecutor` and `RecordSource` backed by the action service
#[derive(Clone)]
pub struct ActionServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl ActionServiceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn execute_url(&self) -> String {
        format!("{}/v1/nodes/execute", self.base_url)
    }

    fn record_url(&self, record_id: Uuid) -> String {
        format!("{}/v1/records/{}", self.base_url, record_id)
    }
}

#[async_trait]
impl NodeExecutor for ActionServiceClient {
    #[instrument(skip(self, execution, definition), fields(execution_id = %execution.id))]
    async fn execute(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
    ) -> Result<NodeReport, NodeError> {
        let response = self
            .http
            .post(self.execute_url())
            .json(&ExecuteNodeRequest {
                execution,
                definition,
            })
            .send()
            .await
            .map_err(|e| NodeError::Transport(describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let report: NodeReport = response
            .json()
            .await
            .map_err(|e| NodeError::Failed(format!("invalid node report: {e}")))?;

        debug!(node_id = %report.node_id, "Action service ran node");
        Ok(report)
    }
}

#[async_trait]
impl RecordSource for ActionServiceClient {
    #[instrument(skip(self))]
    async fn get_record(&self, record_id: Uuid) -> Result<Option<serde_json::Value>, SourceError> {
        let response = self
            .http
            .get(self.record_url(record_id))
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(describe(&e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response.error_for_status().map_err(|e| {
            warn!(%record_id, error = %e, "Record lookup failed");
            SourceError::Unavailable(describe(&e))
        })?;

        let record = response
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("invalid record body: {e}")))?;
        Ok(Some(record))
    }
}

/// Word transport failures so the dispatcher recognises them as transient
fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("action service request timed out: {e}")
    } else if e.is_connect() {
        format!("action service connection failed: {e}")
    } else {
        e.to_string()
    }
}

fn status_error(status: StatusCode, body: &str) -> NodeError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            NodeError::Transport(format!(
                "action service temporarily unavailable ({})",
                status.as_u16()
            ))
        }
        _ => NodeError::Failed(format!(
            "action service returned {}: {}",
            status.as_u16(),
            body.trim()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_durable::reliability::is_transient;

    #[test]
    fn test_urls_ignore_trailing_slash() {
        let client =
            ActionServiceClient::new("http://actions.local/", Duration::from_secs(5)).unwrap();
        let id = Uuid::nil();

        assert_eq!(client.execute_url(), "http://actions.local/v1/nodes/execute");
        assert_eq!(
            client.record_url(id),
            "http://actions.local/v1/records/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_gateway_errors_are_transient() {
        for status in [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            let err = status_error(status, "");
            assert!(matches!(err, NodeError::Transport(_)));
            assert!(is_transient(&err.to_string()), "{status} should retry");
        }
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        let err = status_error(StatusCode::UNPROCESSABLE_ENTITY, " unknown node type\n");

        assert_eq!(
            err.to_string(),
            "action service returned 422: unknown node type"
        );
        assert!(!is_transient(&err.to_string()));
    }
}
