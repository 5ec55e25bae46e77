//! Engine and scheduler configuration
//!
//! Both structs have sensible defaults and can be overridden from the
//! environment with `from_env()`.

use std::time::Duration;

use crate::reliability::RetryPolicy;

/// Read an environment variable and parse it, falling back on any error
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Configuration for the execution runner and dispatcher
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries allowed per node before the execution fails
    pub max_step_retries: u32,

    /// Backoff between step retries (`max_attempts` is ignored here)
    pub step_retry: RetryPolicy,

    /// Attempt retry for transient dispatch failures
    pub dispatch_retry: RetryPolicy,

    /// Consecutive `Continue` reports allowed in one dispatch
    pub max_nodes_per_dispatch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            step_retry: RetryPolicy::exponential()
                .with_initial_interval(Duration::from_secs(60))
                .with_max_interval(Duration::from_secs(3600))
                .with_jitter(0.0),
            dispatch_retry: RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(Duration::from_secs(1))
                .with_max_interval(Duration::from_secs(30)),
            max_nodes_per_dispatch: 1000,
        }
    }
}

impl EngineConfig {
    /// Load from `FLOWLINE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let step_initial = env_or(
            "FLOWLINE_STEP_RETRY_INITIAL_SECS",
            defaults.step_retry.initial_interval.as_secs(),
        );
        let step_max = env_or(
            "FLOWLINE_STEP_RETRY_MAX_SECS",
            defaults.step_retry.max_interval.as_secs(),
        );
        let dispatch_attempts = env_or(
            "FLOWLINE_DISPATCH_MAX_ATTEMPTS",
            defaults.dispatch_retry.max_attempts,
        );

        Self {
            max_step_retries: env_or("FLOWLINE_MAX_STEP_RETRIES", defaults.max_step_retries),
            step_retry: defaults
                .step_retry
                .with_initial_interval(Duration::from_secs(step_initial))
                .with_max_interval(Duration::from_secs(step_max)),
            dispatch_retry: defaults.dispatch_retry.with_max_attempts(dispatch_attempts),
            max_nodes_per_dispatch: env_or(
                "FLOWLINE_MAX_NODES_PER_DISPATCH",
                defaults.max_nodes_per_dispatch,
            )
            .max(1),
        }
    }

    pub fn with_max_step_retries(mut self, max: u32) -> Self {
        self.max_step_retries = max;
        self
    }

    pub fn with_step_retry(mut self, policy: RetryPolicy) -> Self {
        self.step_retry = policy;
        self
    }

    pub fn with_dispatch_retry(mut self, policy: RetryPolicy) -> Self {
        self.dispatch_retry = policy;
        self
    }

    pub fn with_max_nodes_per_dispatch(mut self, max: usize) -> Self {
        self.max_nodes_per_dispatch = max.max(1);
        self
    }
}

// =============================================================================
// SchedulerConfig
// =============================================================================

/// Configuration for the reconciliation scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the resume, timeout and retry jobs
    pub tick: Duration,

    /// Period of the retention cleanup job
    pub cleanup_interval: Duration,

    /// Terminal executions older than this many days are deleted
    pub retention_days: u32,

    /// Rows fetched per job run
    pub batch_size: usize,

    /// Dispatches in flight per job run
    pub concurrency: usize,

    /// How long a job lease stays valid without renewal
    pub lease_ttl: Duration,

    /// A `running` execution untouched for this long is reclaimed. Must
    /// exceed the longest single node execution including dispatch retries.
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5000),
            cleanup_interval: Duration::from_secs(3600),
            retention_days: 30,
            batch_size: 100,
            concurrency: 8,
            lease_ttl: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    /// Load from `FLOWLINE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            tick: Duration::from_millis(
                env_or("FLOWLINE_SCHEDULER_TICK_MS", defaults.tick.as_millis() as u64).max(1),
            ),
            cleanup_interval: Duration::from_secs(
                env_or(
                    "FLOWLINE_CLEANUP_INTERVAL_SECS",
                    defaults.cleanup_interval.as_secs(),
                )
                .max(1),
            ),
            retention_days: env_or("FLOWLINE_RETENTION_DAYS", defaults.retention_days),
            batch_size: env_or("FLOWLINE_SCHEDULER_BATCH_SIZE", defaults.batch_size).max(1),
            concurrency: env_or("FLOWLINE_SCHEDULER_CONCURRENCY", defaults.concurrency).max(1),
            lease_ttl: Duration::from_secs(env_or(
                "FLOWLINE_JOB_LEASE_SECS",
                defaults.lease_ttl.as_secs(),
            )),
            stale_after: Duration::from_secs(
                env_or("FLOWLINE_STALE_RUN_SECS", defaults.stale_after.as_secs()).max(1),
            ),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_step_retries, 3);
        assert_eq!(config.step_retry.backoff(0), Duration::from_secs(60));
        assert_eq!(config.step_retry.backoff(1), Duration::from_secs(120));
        assert_eq!(config.dispatch_retry.max_attempts, 3);
        assert_eq!(config.max_nodes_per_dispatch, 1000);
    }

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick, Duration::from_secs(5));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_builders_clamp() {
        let config = SchedulerConfig::default()
            .with_batch_size(0)
            .with_concurrency(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.concurrency, 1);

        let engine = EngineConfig::default().with_max_nodes_per_dispatch(0);
        assert_eq!(engine.max_nodes_per_dispatch, 1);
    }

    #[test]
    fn test_from_env_clamps_zero() {
        // Only this test sets these variables
        std::env::set_var("FLOWLINE_MAX_NODES_PER_DISPATCH", "0");
        std::env::set_var("FLOWLINE_SCHEDULER_TICK_MS", "0");
        std::env::set_var("FLOWLINE_STALE_RUN_SECS", "0");

        let engine = EngineConfig::from_env();
        let scheduler = SchedulerConfig::from_env();

        std::env::remove_var("FLOWLINE_MAX_NODES_PER_DISPATCH");
        std::env::remove_var("FLOWLINE_SCHEDULER_TICK_MS");
        std::env::remove_var("FLOWLINE_STALE_RUN_SECS");

        assert_eq!(engine.max_nodes_per_dispatch, 1);
        assert_eq!(scheduler.tick, Duration::from_millis(1));
        assert_eq!(scheduler.stale_after, Duration::from_secs(1));
    }
}
