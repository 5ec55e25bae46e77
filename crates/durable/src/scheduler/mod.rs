//! Reconciliation scheduler
//!
//! Converts due deadlines, expired waits and ready retries into state
//! transitions, and deletes old terminal executions.

mod jobs;
mod runner;

pub use jobs::{JobKind, JobReport, ReconciliationJobs, STALE_STEP_ERROR};
pub use runner::ReconciliationScheduler;
