//! Persistence layer for workflow executions
//!
//! This module provides:
//! - [`ExecutionStore`] trait for executions, steps, subscriptions and leases
//! - [`InMemoryExecutionStore`] for testing
//! - [`PostgresExecutionStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryExecutionStore;
pub use postgres::{PostgresDefinitionSource, PostgresExecutionStore};
pub use store::{
    merge_object, ExecutionPatch, ExecutionStore, StepPatch, StoreError, TransitionGuard,
    WaitChange,
};
