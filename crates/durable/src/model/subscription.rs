//! Event subscriptions correlating a waiting execution to an expected event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Expected key/value pairs; keys may be dotted paths into the payload
pub type EventFilter = serde_json::Map<String, serde_json::Value>;

/// Persisted record of a pause-for-event
///
/// Once `is_active` goes false the row is an audit record and is never
/// reactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEventSubscription {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workspace_id: Uuid,
    pub event_type: String,
    pub event_filter: EventFilter,
    pub timeout_at: DateTime<Utc>,
    pub is_active: bool,
    pub matched_at: Option<DateTime<Utc>>,
    pub matched_event_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowEventSubscription {
    pub fn is_matched(&self) -> bool {
        self.matched_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at <= now
    }
}

/// Subscription to open inside a pause-for-event transition
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub workspace_id: Uuid,
    pub event_type: String,
    pub event_filter: EventFilter,
    pub timeout_at: DateTime<Utc>,
}

impl NewSubscription {
    pub fn into_row(self, execution_id: Uuid, now: DateTime<Utc>) -> WorkflowEventSubscription {
        WorkflowEventSubscription {
            id: Uuid::now_v7(),
            execution_id,
            workspace_id: self.workspace_id,
            event_type: self.event_type,
            event_filter: self.event_filter,
            timeout_at: self.timeout_at,
            is_active: true,
            matched_at: None,
            matched_event_data: None,
            created_at: now,
        }
    }
}

/// Match stamp written when an event wins a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMatch {
    pub matched_at: DateTime<Utc>,
    pub event_data: serde_json::Value,
}
