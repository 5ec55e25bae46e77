//! Event ingestion and correlation
//!
//! An incoming event is matched against the active subscriptions of its
//! workspace and type. For each match:
//!
//! 1. The subscription is deactivated with the match stamp. This flip of
//!    `is_active` is the only gate between an event and the timeout sweep;
//!    whoever flips it owns the outcome.
//! 2. The event is merged into the execution context while it is still
//!    paused on an event.
//! 3. A resume is dispatched, which clears the wait fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::engine::{Dispatch, DispatchCommand, DispatchOutcome, EngineError, Transition};
use crate::model::{SubscriptionMatch, WorkflowEventSubscription};
use crate::persistence::{ExecutionStore, StoreError};

use super::path::filter_matches;

/// One execution resumed (or attempted) by an event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedExecution {
    pub execution_id: Uuid,
    pub subscription_id: Uuid,

    /// Result of the resume dispatch, absent if it errored
    pub outcome: Option<DispatchOutcome>,
    pub error: Option<String>,
}

/// What one `handle_event` call did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventReport {
    /// Active subscriptions of the workspace and type
    pub candidates: usize,

    pub matched: Vec<MatchedExecution>,

    /// Filter matched but another actor flipped the subscription first
    pub raced: usize,

    /// Filter matched but the deadline had already passed
    pub expired: usize,

    /// Subscription won but the execution was no longer waiting
    pub stale: usize,
}

impl EventReport {
    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }
}

/// Entry point for external events
pub struct EventGateway {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<dyn Dispatch>,
    clock: Arc<dyn Clock>,
}

impl EventGateway {
    pub fn new(store: Arc<dyn ExecutionStore>, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Correlate one event to the executions waiting for it
    ///
    /// Safe to call concurrently and before any subscription exists; an event
    /// nobody waits for is a no-op. One event may resume several executions.
    #[instrument(skip(self, payload))]
    pub async fn handle_event(
        &self,
        workspace_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EventReport, EngineError> {
        let now = self.clock.now();
        let subscriptions = self
            .store
            .list_active_subscriptions(workspace_id, event_type)
            .await?;

        let mut report = EventReport {
            candidates: subscriptions.len(),
            ..Default::default()
        };

        for subscription in subscriptions {
            if !filter_matches(&subscription.event_filter, &payload) {
                continue;
            }
            if subscription.is_expired(now) {
                // Left for the timeout sweep
                debug!(subscription_id = %subscription.id, "Event arrived after wait deadline");
                report.expired += 1;
                continue;
            }

            let stamp = SubscriptionMatch {
                matched_at: now,
                event_data: payload.clone(),
            };
            if !self
                .store
                .deactivate_subscription(subscription.id, Some(stamp))
                .await?
            {
                debug!(subscription_id = %subscription.id, "Lost subscription race");
                report.raced += 1;
                continue;
            }

            match self
                .deliver(&subscription, event_type, payload.clone(), now)
                .await
            {
                Some(matched) => report.matched.push(matched),
                None => report.stale += 1,
            }
        }

        if report.matched.is_empty() {
            debug!(candidates = report.candidates, "Event matched no waiting execution");
        } else {
            info!(matched = report.matched.len(), "Event resumed waiting executions");
        }
        Ok(report)
    }

    /// Finish delivering a subscription that was matched but whose execution
    /// is still paused, e.g. after a crash between the match and the resume
    ///
    /// The merge writes the values stamped on the subscription, so repeating
    /// it is harmless.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    pub async fn redeliver(
        &self,
        subscription: &WorkflowEventSubscription,
    ) -> Option<MatchedExecution> {
        let (Some(matched_at), Some(event_data)) = (
            subscription.matched_at,
            subscription.matched_event_data.clone(),
        ) else {
            return None;
        };
        warn!(
            execution_id = %subscription.execution_id,
            %matched_at,
            "Redelivering matched event to a still-paused execution"
        );
        self.deliver(subscription, &subscription.event_type, event_data, matched_at)
            .await
    }

    async fn deliver(
        &self,
        subscription: &WorkflowEventSubscription,
        event_type: &str,
        event_data: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Option<MatchedExecution> {
        let execution_id = subscription.execution_id;
        let merged = Transition::receive_event(event_type, event_data, received_at)
            .apply(self.store.as_ref(), execution_id, self.clock.now())
            .await;

        match merged {
            Ok(true) => {}
            Ok(false) | Err(StoreError::ExecutionNotFound(_)) => {
                warn!(%execution_id, "Matched execution is no longer waiting for an event");
                return None;
            }
            Err(err) => {
                error!(%execution_id, %err, "Could not merge event into context");
                return Some(MatchedExecution {
                    execution_id,
                    subscription_id: subscription.id,
                    outcome: None,
                    error: Some(err.to_string()),
                });
            }
        }

        let (outcome, error) = match self
            .dispatcher
            .dispatch(DispatchCommand::Resume { execution_id })
            .await
        {
            Ok(outcome) => (Some(outcome), None),
            Err(err) => {
                error!(%execution_id, %err, "Resume after event failed");
                (None, Some(err.to_string()))
            }
        };

        Some(MatchedExecution {
            execution_id,
            subscription_id: subscription.id,
            outcome,
            error,
        })
    }
}
