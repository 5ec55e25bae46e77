//! Read-only collaborators: workflow definitions and business records

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::WorkflowDefinition;

/// Error from a lookup collaborator
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The backing service could not answer
    #[error("lookup unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of workflow definitions by id
#[async_trait]
pub trait DefinitionSource: Send + Sync + 'static {
    async fn get_definition(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, SourceError>;
}

/// Lookup of business-record snapshots used to seed an execution's context
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    async fn get_record(&self, record_id: Uuid) -> Result<Option<serde_json::Value>, SourceError>;
}

/// Fixed set of definitions held in memory
#[derive(Default)]
pub struct StaticDefinitions {
    definitions: RwLock<HashMap<Uuid, WorkflowDefinition>>,
}

impl StaticDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions.write().insert(definition.id, definition);
    }

    pub fn remove(&self, workflow_id: Uuid) -> Option<WorkflowDefinition> {
        self.definitions.write().remove(&workflow_id)
    }
}

#[async_trait]
impl DefinitionSource for StaticDefinitions {
    async fn get_definition(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, SourceError> {
        Ok(self.definitions.read().get(&workflow_id).cloned())
    }
}

/// Fixed set of record snapshots held in memory
#[derive(Default)]
pub struct StaticRecords {
    records: RwLock<HashMap<Uuid, serde_json::Value>>,
}

impl StaticRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record_id: Uuid, snapshot: serde_json::Value) {
        self.records.write().insert(record_id, snapshot);
    }
}

#[async_trait]
impl RecordSource for StaticRecords {
    async fn get_record(&self, record_id: Uuid) -> Result<Option<serde_json::Value>, SourceError> {
        Ok(self.records.read().get(&record_id).cloned())
    }
}
