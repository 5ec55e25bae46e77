//! Static catalog of event types workflows can wait for
//!
//! Only used to populate configuration UIs. The gateway accepts any event
//! type; a type missing here simply never appears as a choice.

use serde::Serialize;

/// One waitable event type and the payload paths useful as filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupportedEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub filter_fields: &'static [&'static str],
}

const SUPPORTED_EVENTS: &[SupportedEvent] = &[
    SupportedEvent {
        event_type: "email.opened",
        label: "Email opened",
        description: "A recipient opened an email sent by a workflow",
        filter_fields: &["record_id", "email_id", "campaign_id"],
    },
    SupportedEvent {
        event_type: "email.clicked",
        label: "Email link clicked",
        description: "A recipient clicked a tracked link in an email",
        filter_fields: &["record_id", "email_id", "link.url"],
    },
    SupportedEvent {
        event_type: "email.replied",
        label: "Email replied",
        description: "A recipient replied to an email",
        filter_fields: &["record_id", "email_id"],
    },
    SupportedEvent {
        event_type: "form.submitted",
        label: "Form submitted",
        description: "A form was submitted",
        filter_fields: &["form_id", "record_id", "fields.email"],
    },
    SupportedEvent {
        event_type: "record.created",
        label: "Record created",
        description: "A record of the given object type was created",
        filter_fields: &["object_type", "record_id"],
    },
    SupportedEvent {
        event_type: "record.updated",
        label: "Record updated",
        description: "A field of a record changed",
        filter_fields: &["object_type", "record_id", "field"],
    },
    SupportedEvent {
        event_type: "deal.stage_changed",
        label: "Deal stage changed",
        description: "A deal moved to another pipeline stage",
        filter_fields: &["record_id", "pipeline_id", "stage"],
    },
    SupportedEvent {
        event_type: "meeting.booked",
        label: "Meeting booked",
        description: "A meeting was booked through a scheduling link",
        filter_fields: &["record_id", "calendar_id"],
    },
    SupportedEvent {
        event_type: "webhook.received",
        label: "Webhook received",
        description: "An inbound webhook was received on a workflow endpoint",
        filter_fields: &["endpoint_id"],
    },
];

/// All event types workflows can be configured to wait for
pub fn supported_events() -> &'static [SupportedEvent] {
    SUPPORTED_EVENTS
}

/// Look up one catalog entry
pub fn find_supported_event(event_type: &str) -> Option<&'static SupportedEvent> {
    SUPPORTED_EVENTS.iter().find(|e| e.event_type == event_type)
}
