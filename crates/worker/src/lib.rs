//! Flowline worker: HTTP surface, action-service client and process wiring

pub mod action_client;
pub mod api;
pub mod config;

pub use action_client::ActionServiceClient;
pub use api::{routes, AppState};
pub use config::WorkerConfig;
