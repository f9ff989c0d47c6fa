use crate::storage::SharedStore;
use crate::types::{ExecutionId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

fn letter_key(execution_id: &ExecutionId) -> String {
    format!("dlq:{}", execution_id)
}

/// A dead-lettered execution, captured for offline triage and replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub input_data: Value,
    pub error: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable store of executions that failed unrecoverably. Entries have no
/// TTL; replay tooling removes them explicitly once handled.
pub struct DeadLetterQueue {
    store: Arc<dyn SharedStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, letter: DeadLetter) -> anyhow::Result<()> {
        let json = serde_json::to_string(&letter)?;
        self.store
            .set(&letter_key(&letter.execution_id), &json, None)
            .await
    }

    /// Capture a workflow-level failure. An enqueue failure is logged and
    /// swallowed: it must never mask or replace the original error that is
    /// surfaced to the caller.
    pub async fn push_failure(
        &self,
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        input_data: Value,
        error: impl Into<String>,
    ) {
        let letter = DeadLetter {
            execution_id,
            workflow_id,
            input_data,
            error: error.into(),
            enqueued_at: Utc::now(),
        };
        if let Err(err) = self.enqueue(letter).await {
            tracing::warn!(
                "Failed to dead-letter execution {}: {}",
                execution_id,
                err
            );
        }
    }

    pub async fn list(&self) -> anyhow::Result<Vec<DeadLetter>> {
        let entries = self.store.scan_prefix("dlq:").await?;
        let mut letters = Vec::with_capacity(entries.len());
        for (_, raw) in entries {
            letters.push(serde_json::from_str(&raw)?);
        }
        Ok(letters)
    }

    pub async fn fetch(&self, execution_id: &ExecutionId) -> anyhow::Result<Option<DeadLetter>> {
        match self.store.get(&letter_key(execution_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove a handled entry. Returns false when it was not present.
    pub async fn remove(&self, execution_id: &ExecutionId) -> anyhow::Result<bool> {
        self.store.delete(&letter_key(execution_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn queue() -> DeadLetterQueue {
        DeadLetterQueue::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn enqueue_fetch_remove_roundtrip() {
        let queue = queue();
        let execution_id = ExecutionId::new();

        queue
            .push_failure(
                execution_id,
                WorkflowId::new("wf"),
                json!({"n": 1}),
                "block fetch failed",
            )
            .await;

        let letter = queue.fetch(&execution_id).await.unwrap().unwrap();
        assert_eq!(letter.workflow_id, WorkflowId::new("wf"));
        assert_eq!(letter.error, "block fetch failed");
        assert_eq!(letter.input_data, json!({"n": 1}));

        assert!(queue.remove(&execution_id).await.unwrap());
        assert!(queue.fetch(&execution_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_all_letters() {
        let queue = queue();
        for _ in 0..3 {
            queue
                .push_failure(
                    ExecutionId::new(),
                    WorkflowId::new("wf"),
                    Value::Null,
                    "boom",
                )
                .await;
        }
        assert_eq!(queue.list().await.unwrap().len(), 3);
    }
}
