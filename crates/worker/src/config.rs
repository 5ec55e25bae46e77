//! Worker configuration loaded from the environment

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use flowline_durable::{EngineConfig, SchedulerConfig};
use uuid::Uuid;

/// Everything the worker process needs to boot
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,

    /// Lease holder name; unique per process
    pub worker_id: String,

    pub http_addr: SocketAddr,

    /// Base URL of the service that executes nodes and serves records
    pub action_service_url: String,
    pub action_service_timeout: Duration,

    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;

        let action_service_url = std::env::var("ACTION_SERVICE_URL")
            .context("ACTION_SERVICE_URL environment variable required")?;

        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::now_v7()));

        let http_addr = std::env::var("HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9400".to_string())
            .parse()
            .context("HTTP_ADDR must be a socket address")?;

        let timeout_secs = std::env::var("ACTION_SERVICE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_url,
            database_max_connections,
            worker_id,
            http_addr,
            action_service_url: action_service_url.trim_end_matches('/').to_string(),
            action_service_timeout: Duration::from_secs(timeout_secs),
            engine: EngineConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        })
    }
}
