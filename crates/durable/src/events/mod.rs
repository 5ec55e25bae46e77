//! External event ingestion
//!
//! - [`EventGateway`] correlates events to waiting executions
//! - [`resolve_path`] / [`filter_matches`] evaluate subscription filters
//! - [`supported_events`] lists the event types offered to workflow authors

mod catalog;
mod gateway;
mod path;

pub use catalog::{find_supported_event, supported_events, SupportedEvent};
pub use gateway::{EventGateway, EventReport, MatchedExecution};
pub use path::{filter_matches, resolve_path};
