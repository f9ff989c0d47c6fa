use crate::types::{WorkflowDefinition, WorkflowId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Read-only source of workflow definitions. Persistence and CRUD live
/// outside the engine; this is the consumed interface.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, id: &WorkflowId) -> anyhow::Result<Option<WorkflowDefinition>>;
}

/// In-memory workflow store for embedding and tests.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: WorkflowDefinition) {
        self.workflows
            .write()
            .unwrap()
            .insert(workflow.id.clone(), workflow);
    }
}

#[async_trait::async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn get_workflow(&self, id: &WorkflowId) -> anyhow::Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().unwrap().get(id).cloned())
    }
}
