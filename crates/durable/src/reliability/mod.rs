//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`is_transient`] - Heuristic separating retryable failures from terminal ones

mod retry;
mod transient;

pub use retry::RetryPolicy;
pub use transient::is_transient;
