//! Lifecycle transitions as guard + patch pairs
//!
//! Every state change of an execution is one of these, applied through
//! [`ExecutionStore::try_transition`]. Keeping them in one place means a
//! manual cancel and a sweep-driven failure can never disagree about which
//! fields they touch.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{EventFilter, ExecutionStatus, NewSubscription};
use crate::persistence::{ExecutionPatch, ExecutionStore, StoreError, TransitionGuard, WaitChange};

/// Error text written on a user cancel
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Prefix of the error written when an event wait expires
pub const EVENT_WAIT_TIMEOUT: &str = "event_wait_timeout";

/// Error text for an expired event wait
pub fn event_wait_timeout_message(event_type: &str) -> String {
    format!("{EVENT_WAIT_TIMEOUT}: timed out waiting for event '{event_type}'")
}

/// A compare-and-swap against one execution row
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub guard: TransitionGuard,
    pub patch: ExecutionPatch,
}

impl Transition {
    /// `pending -> running`
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Pending),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Running)
                .with_started_at(now),
        }
    }

    /// `paused -> running`, dropping every wake condition
    pub fn resume() -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Paused),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Running)
                .with_wait(WaitChange::Clear)
                .closing_subscriptions(),
        }
    }

    /// Any non-terminal status to `cancelled`
    pub fn cancel(now: DateTime<Utc>) -> Self {
        Self {
            guard: TransitionGuard::non_terminal(),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Cancelled)
                .with_completed_at(now)
                .with_error(CANCELLED_BY_USER)
                .with_wait(WaitChange::Clear)
                .closing_subscriptions(),
        }
    }

    /// `running -> failed`
    pub fn fail(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Running),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Failed)
                .with_error(error)
                .with_completed_at(now),
        }
    }

    /// `paused` on an event to `failed` after the wait deadline
    pub fn time_out(event_type: &str, now: DateTime<Utc>) -> Self {
        Self::abandon_wait(event_wait_timeout_message(event_type), now)
    }

    /// `paused` on an event to `failed` with `error`
    pub fn abandon_wait(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            guard: TransitionGuard::awaiting_event(),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Failed)
                .with_error(error)
                .with_completed_at(now)
                .with_wait(WaitChange::Clear)
                .closing_subscriptions(),
        }
    }

    /// Touch `updated_at` of a running execution
    ///
    /// Fails the guard once anything else moved the row out of `running`.
    pub fn heartbeat() -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Running),
            patch: ExecutionPatch::new(),
        }
    }

    /// Stamp a matched event into the context of a paused execution
    ///
    /// The status does not change here; the resume that follows clears the
    /// wait fields.
    pub fn receive_event(
        event_type: &str,
        event_data: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        let mut keys = serde_json::Map::new();
        keys.insert("event_data".into(), event_data);
        keys.insert("event_type".into(), serde_json::Value::from(event_type));
        keys.insert(
            "event_received_at".into(),
            serde_json::Value::from(received_at.to_rfc3339()),
        );

        Self {
            guard: TransitionGuard::awaiting_event(),
            patch: ExecutionPatch::new().with_merged_context(keys),
        }
    }

    /// Context update of a running execution between nodes
    pub fn checkpoint(context: serde_json::Value) -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Running),
            patch: ExecutionPatch::new().with_context(Some(context)),
        }
    }

    /// `running -> paused` until `resume_at`
    pub fn pause_until(
        resume_at: DateTime<Utc>,
        context: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Running),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Paused)
                .with_context(context)
                .with_wait(WaitChange::Until {
                    resume_at,
                    paused_at: now,
                }),
        }
    }

    /// `running -> paused` on an event, opening its subscription
    pub fn pause_for_event(
        workspace_id: Uuid,
        event_type: String,
        filter: EventFilter,
        timeout_at: DateTime<Utc>,
        context: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Running),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Paused)
                .with_context(context)
                .with_wait(WaitChange::ForEvent {
                    event_type: event_type.clone(),
                    timeout_at,
                    paused_at: now,
                })
                .with_subscription(NewSubscription {
                    workspace_id,
                    event_type,
                    event_filter: filter,
                    timeout_at,
                }),
        }
    }

    /// `running -> completed`
    pub fn complete(context: Option<serde_json::Value>, now: DateTime<Utc>) -> Self {
        Self {
            guard: TransitionGuard::from_status(ExecutionStatus::Running),
            patch: ExecutionPatch::new()
                .with_status(ExecutionStatus::Completed)
                .with_context(context)
                .with_completed_at(now),
        }
    }

    /// Apply against the store; `false` means another actor got there first
    pub async fn apply(
        self,
        store: &dyn ExecutionStore,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        store.try_transition(id, &self.guard, self.patch, now).await
    }
}
