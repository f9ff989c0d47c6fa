use crate::error::EngineError;
use crate::storage::SharedStore;
use crate::types::{BlockId, ExecutionId, ExecutionState, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn state_key(execution_id: &ExecutionId) -> String {
    format!("execution:state:{}", execution_id)
}

fn history_key(execution_id: &ExecutionId) -> String {
    format!("execution:history:{}", execution_id)
}

/// One entry of the append-only transition history, kept apart from the
/// current-state document for audit and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: ExecutionState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Named, timestamped deep snapshot of the state document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    pub state_snapshot: Value,
    pub created_at: DateTime<Utc>,
}

/// Result snapshot for one node, embedded in the state document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub result: Value,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// The distributed execution-state document. Mutated only through declared
/// transitions and mirrored to the shared store for cross-process visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStateDocument {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub state: ExecutionState,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub current_node_id: Option<BlockId>,
    pub node_results: HashMap<String, NodeResult>,
    pub checkpoints: Vec<Checkpoint>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Manages execution-state documents: the nine-state machine, the transition
/// history, checkpoints, and shared-store mirroring with a TTL.
///
/// Without a shared store the manager degrades to process-local memory:
/// every operation still works, but visibility is limited to this instance.
pub struct StateManager {
    documents: Mutex<HashMap<ExecutionId, ExecutionStateDocument>>,
    history: Mutex<HashMap<ExecutionId, Vec<StateHistoryEntry>>>,
    store: Option<Arc<dyn SharedStore>>,
    ttl: Duration,
}

impl StateManager {
    pub fn new(store: Option<Arc<dyn SharedStore>>, ttl: Duration) -> Self {
        if store.is_none() {
            tracing::info!(
                "No shared store configured; execution state is process-local only"
            );
        }
        Self {
            documents: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            store,
            ttl,
        }
    }

    /// Create the state document for a new execution in `Pending`.
    pub async fn create_execution(
        &self,
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        input_data: Value,
    ) -> ExecutionStateDocument {
        let now = Utc::now();
        let document = ExecutionStateDocument {
            execution_id,
            workflow_id,
            state: ExecutionState::Pending,
            input_data,
            output_data: None,
            current_node_id: None,
            node_results: HashMap::new(),
            checkpoints: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        };

        self.documents
            .lock()
            .unwrap()
            .insert(execution_id, document.clone());
        self.history.lock().unwrap().insert(
            execution_id,
            vec![StateHistoryEntry {
                state: ExecutionState::Pending,
                reason: "execution created".to_string(),
                timestamp: now,
            }],
        );

        self.mirror(execution_id).await;
        document
    }

    /// Fetch a document, falling back to the shared store for executions
    /// created by another process.
    pub async fn get(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionStateDocument>, EngineError> {
        self.ensure_loaded(execution_id).await?;
        Ok(self.documents.lock().unwrap().get(execution_id).cloned())
    }

    /// Current state with cross-process freshness: when a shared store is
    /// configured, the mirrored document is re-read so control requests
    /// (pause/cancel) made by other processes become visible here.
    pub async fn current_state(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionState>, EngineError> {
        if let Some(store) = &self.store {
            let mirrored = store
                .get(&state_key(execution_id))
                .await
                .map_err(|e| EngineError::Store(e.to_string()))?;
            if let Some(raw) = mirrored {
                if let Ok(document) = serde_json::from_str::<ExecutionStateDocument>(&raw) {
                    let state = document.state;
                    self.documents
                        .lock()
                        .unwrap()
                        .insert(*execution_id, document);
                    return Ok(Some(state));
                }
            }
        }
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(execution_id)
            .map(|d| d.state))
    }

    /// Apply a state transition. Anything outside the declared table fails
    /// with `InvalidStateTransition` and leaves the stored state untouched;
    /// every accepted transition appends one history entry.
    pub async fn transition(
        &self,
        execution_id: &ExecutionId,
        to: ExecutionState,
        reason: impl Into<String>,
    ) -> Result<ExecutionStateDocument, EngineError> {
        self.ensure_loaded(execution_id).await?;
        let reason = reason.into();
        let now = Utc::now();

        let document = {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

            let from = document.state;
            if !from.can_transition_to(to) {
                return Err(EngineError::InvalidStateTransition { from, to });
            }

            document.state = to;
            document.updated_at = now;
            if to == ExecutionState::Running && document.started_at.is_none() {
                document.started_at = Some(now);
            }
            if to.is_terminal() {
                document.completed_at = Some(now);
            }

            tracing::info!(
                "Execution {} transitioned {} -> {} ({})",
                execution_id,
                from,
                to,
                reason
            );
            document.clone()
        };

        self.history
            .lock()
            .unwrap()
            .entry(*execution_id)
            .or_default()
            .push(StateHistoryEntry {
                state: to,
                reason,
                timestamp: now,
            });

        self.mirror(*execution_id).await;
        Ok(document)
    }

    /// Record a node's result snapshot and advance the current-node marker.
    pub async fn record_node_result(
        &self,
        execution_id: &ExecutionId,
        block_id: &BlockId,
        result: Value,
        status: &str,
    ) -> Result<(), EngineError> {
        {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
            document.node_results.insert(
                block_id.0.clone(),
                NodeResult {
                    result,
                    status: status.to_string(),
                    timestamp: Utc::now(),
                },
            );
            document.current_node_id = Some(block_id.clone());
            document.updated_at = Utc::now();
        }
        self.mirror(*execution_id).await;
        Ok(())
    }

    pub async fn set_output(
        &self,
        execution_id: &ExecutionId,
        output: Value,
    ) -> Result<(), EngineError> {
        {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
            document.output_data = Some(output);
            document.updated_at = Utc::now();
        }
        self.mirror(*execution_id).await;
        Ok(())
    }

    pub async fn set_error(
        &self,
        execution_id: &ExecutionId,
        error: impl Into<String>,
    ) -> Result<(), EngineError> {
        {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
            document.error = Some(error.into());
            document.updated_at = Utc::now();
        }
        self.mirror(*execution_id).await;
        Ok(())
    }

    /// Append a named, timestamped deep snapshot to the document's
    /// checkpoint list.
    pub async fn create_checkpoint(
        &self,
        execution_id: &ExecutionId,
        name: impl Into<String>,
    ) -> Result<Checkpoint, EngineError> {
        self.ensure_loaded(execution_id).await?;
        let name = name.into();

        let checkpoint = {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

            let snapshot = serde_json::to_value(&*document)
                .map_err(|e| EngineError::Store(format!("failed to snapshot state: {}", e)))?;
            let checkpoint = Checkpoint {
                id: uuid::Uuid::new_v4().to_string(),
                name,
                state_snapshot: snapshot,
                created_at: Utc::now(),
            };
            document.checkpoints.push(checkpoint.clone());
            document.updated_at = Utc::now();
            checkpoint
        };

        self.mirror(*execution_id).await;
        Ok(checkpoint)
    }

    /// Replace the live document's run-specific fields with a checkpoint's
    /// snapshot. The checkpoint list itself survives, metadata gains
    /// `restored_from`, and the restore is logged as a transition.
    pub async fn restore_checkpoint(
        &self,
        execution_id: &ExecutionId,
        checkpoint_id: &str,
    ) -> Result<ExecutionStateDocument, EngineError> {
        self.ensure_loaded(execution_id).await?;
        let now = Utc::now();

        let (document, restored_state) = {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

            let checkpoint = document
                .checkpoints
                .iter()
                .find(|c| c.id == checkpoint_id)
                .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_id.to_string()))?;

            let snapshot: ExecutionStateDocument =
                serde_json::from_value(checkpoint.state_snapshot.clone()).map_err(|e| {
                    EngineError::Store(format!("failed to decode checkpoint snapshot: {}", e))
                })?;

            document.state = snapshot.state;
            document.input_data = snapshot.input_data;
            document.output_data = snapshot.output_data;
            document.current_node_id = snapshot.current_node_id;
            document.node_results = snapshot.node_results;
            document.started_at = snapshot.started_at;
            document.completed_at = snapshot.completed_at;
            document.error = snapshot.error;
            document.metadata = snapshot.metadata;
            document
                .metadata
                .insert("restored_from".to_string(), Value::String(checkpoint_id.to_string()));
            document.updated_at = now;

            (document.clone(), snapshot.state)
        };

        self.history
            .lock()
            .unwrap()
            .entry(*execution_id)
            .or_default()
            .push(StateHistoryEntry {
                state: restored_state,
                reason: format!("restored from checkpoint {}", checkpoint_id),
                timestamp: now,
            });

        self.mirror(*execution_id).await;
        Ok(document)
    }

    pub async fn history(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<StateHistoryEntry>, EngineError> {
        self.ensure_loaded(execution_id).await?;
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Drop the local copies of a terminal execution. The mirrored document
    /// and history remain in the shared store until their TTL expires, so the
    /// in-process maps stay bounded.
    pub fn evict_terminal(&self, execution_id: &ExecutionId) {
        let mut documents = self.documents.lock().unwrap();
        let terminal = documents
            .get(execution_id)
            .map(|d| d.state.is_terminal())
            .unwrap_or(false);
        if terminal {
            documents.remove(execution_id);
            self.history.lock().unwrap().remove(execution_id);
        }
    }

    /// Load a document created by another process from the shared store.
    async fn ensure_loaded(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        if self.documents.lock().unwrap().contains_key(execution_id) {
            return Ok(());
        }
        let Some(store) = &self.store else {
            return Ok(());
        };

        let raw_doc = store
            .get(&state_key(execution_id))
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        if let Some(raw) = raw_doc {
            let document: ExecutionStateDocument = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Store(format!("corrupt mirrored state: {}", e)))?;
            self.documents
                .lock()
                .unwrap()
                .insert(*execution_id, document);

            let raw_history = store
                .get(&history_key(execution_id))
                .await
                .map_err(|e| EngineError::Store(e.to_string()))?;
            if let Some(raw) = raw_history {
                if let Ok(entries) = serde_json::from_str::<Vec<StateHistoryEntry>>(&raw) {
                    self.history.lock().unwrap().insert(*execution_id, entries);
                }
            }
        }
        Ok(())
    }

    /// Best-effort mirror of document and history to the shared store under
    /// the configured TTL. Mirroring failures are logged, not propagated:
    /// the local document stays authoritative for this process.
    async fn mirror(&self, execution_id: ExecutionId) {
        let Some(store) = &self.store else {
            return;
        };

        let document = self.documents.lock().unwrap().get(&execution_id).cloned();
        if let Some(document) = document {
            match serde_json::to_string(&document) {
                Ok(json) => {
                    if let Err(err) = store
                        .set(&state_key(&execution_id), &json, Some(self.ttl))
                        .await
                    {
                        tracing::warn!("Failed to mirror state for {}: {}", execution_id, err);
                    }
                }
                Err(err) => {
                    tracing::warn!("Failed to serialize state for {}: {}", execution_id, err)
                }
            }
        }

        let history = self.history.lock().unwrap().get(&execution_id).cloned();
        if let Some(history) = history {
            match serde_json::to_string(&history) {
                Ok(json) => {
                    if let Err(err) = store
                        .set(&history_key(&execution_id), &json, Some(self.ttl))
                        .await
                    {
                        tracing::warn!("Failed to mirror history for {}: {}", execution_id, err);
                    }
                }
                Err(err) => {
                    tracing::warn!("Failed to serialize history for {}: {}", execution_id, err)
                }
            }
        }
    }
}
