use crate::types::{BlockId, ExecutionId, ExecutionState, TriggerKind, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in an execution's lifecycle log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl ExecutionEvent {
    pub fn new(execution_id: ExecutionId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while an execution runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Execution lifecycle
    ExecutionStarted {
        workflow_id: WorkflowId,
        trigger: TriggerKind,
    },
    ExecutionCompleted {
        duration_ms: u64,
    },
    ExecutionFailed {
        error: String,
        duration_ms: u64,
    },
    ExecutionCancelled {
        reason: String,
    },
    ExecutionTimedOut {
        budget_secs: u64,
    },

    // Block lifecycle
    BlockStarted {
        block_id: BlockId,
        attempt: u32,
    },
    BlockCompleted {
        block_id: BlockId,
        duration_ms: u64,
    },
    BlockFailed {
        block_id: BlockId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    // Distributed state
    StateTransitioned {
        from: ExecutionState,
        to: ExecutionState,
        reason: String,
    },
    CheckpointCreated {
        checkpoint_id: String,
        name: String,
    },
    CheckpointRestored {
        checkpoint_id: String,
    },
    DeadLettered {
        error: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: ExecutionEvent) -> anyhow::Result<()>;

    /// Get all events for an execution, in timestamp order
    async fn execution_events(&self, execution_id: ExecutionId)
        -> anyhow::Result<Vec<ExecutionEvent>>;
}
