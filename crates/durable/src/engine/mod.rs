//! Execution engine
//!
//! - [`NodeExecutor`] runs nodes and reports what happens next
//! - [`ExecutionRunner`] applies lifecycle transitions and runs nodes
//! - [`Dispatcher`] wraps the runner with attempt-level retry
//! - [`Transition`] names every guarded state change

mod dispatcher;
mod node;
mod runner;
mod transition;

pub use dispatcher::{Dispatch, DispatchCommand, Dispatcher};
pub use node::{NodeError, NodeExecutor, NodeOutcome, NodeReport};
pub use runner::{DispatchOutcome, EngineError, ExecutionRunner};
pub use transition::{
    event_wait_timeout_message, Transition, CANCELLED_BY_USER, EVENT_WAIT_TIMEOUT,
};
