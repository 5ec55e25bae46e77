//! # Durable Workflow-Automation Engine
//!
//! A PostgreSQL-backed engine for long-running, resumable automations.
//!
//! ## Features
//!
//! - **Row-based durability**: executions, steps and event subscriptions are plain rows; a crash loses nothing
//! - **Indefinite suspension**: pause for a duration or until an external event, with a deadline
//! - **Event correlation**: concurrent events and timeout sweeps resolve to exactly one winner
//! - **Step retries**: per-node retry with bounded exponential backoff
//! - **Compare-and-swap only**: every state change is a predicate-guarded update, no locks
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────────────┐
//! │     EventGateway     │   │   ReconciliationScheduler    │
//! │  (handle_event)      │   │ (resume / timeout / retry /  │
//! │                      │   │  cleanup, one loop per job)  │
//! └──────────────────────┘   └──────────────────────────────┘
//!             │                             │
//!             └──────────────┬──────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Dispatcher (attempt retry)                  │
//! │      ExecutionRunner (lifecycle + node run loop)            │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                         │
//! │  (PostgreSQL: workflow_executions, steps, subscriptions)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowline_durable::prelude::*;
//!
//! let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
//! let runner = Arc::new(ExecutionRunner::new(store.clone(), definitions, records, executor));
//! let dispatcher: Arc<dyn Dispatch> = Arc::new(Dispatcher::new(runner.clone()));
//!
//! let execution = runner.create_execution(workflow_id, None, json!({})).await?;
//! dispatcher.dispatch(DispatchCommand::Start { execution_id: execution.id }).await?;
//!
//! let gateway = EventGateway::new(store.clone(), dispatcher.clone());
//! gateway.handle_event(workspace_id, "form.submitted", json!({"form_id": "F1"})).await?;
//!
//! let jobs = Arc::new(ReconciliationJobs::new(store, dispatcher));
//! let scheduler = ReconciliationScheduler::new(jobs);
//! let handle = scheduler.spawn();
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod source;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{EngineConfig, SchedulerConfig};
    pub use crate::engine::{
        Dispatch, DispatchCommand, DispatchOutcome, Dispatcher, EngineError, ExecutionRunner,
        NodeError, NodeExecutor, NodeOutcome, NodeReport,
    };
    pub use crate::events::{supported_events, EventGateway, EventReport};
    pub use crate::model::{
        ExecutionStatus, StepStatus, WorkflowDefinition, WorkflowEventSubscription,
        WorkflowExecution, WorkflowExecutionStep,
    };
    pub use crate::persistence::{
        ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::scheduler::{JobKind, JobReport, ReconciliationJobs, ReconciliationScheduler};
    pub use crate::source::{DefinitionSource, RecordSource, SourceError};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, SchedulerConfig};
pub use engine::{
    Dispatch, DispatchCommand, DispatchOutcome, Dispatcher, EngineError, ExecutionRunner,
    NodeError, NodeExecutor, NodeOutcome, NodeReport,
};
pub use events::{EventGateway, EventReport};
pub use model::{
    ExecutionStatus, StepStatus, WorkflowDefinition, WorkflowEventSubscription,
    WorkflowExecution, WorkflowExecutionStep,
};
pub use persistence::{
    ExecutionStore, InMemoryExecutionStore, PostgresDefinitionSource, PostgresExecutionStore,
    StoreError,
};
pub use reliability::RetryPolicy;
pub use scheduler::{JobKind, JobReport, ReconciliationJobs, ReconciliationScheduler};
pub use source::{DefinitionSource, RecordSource, SourceError};
