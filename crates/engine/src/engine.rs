use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::dlq::DeadLetterQueue;
use crate::error::{EngineError, ErrorResponse};
use crate::events::{EventLog, EventType, ExecutionEvent};
use crate::idempotency::{BeginOutcome, IdempotencyManager, IdempotencyRecord, IdempotencyStatus};
use crate::lock::{execution_lock_name, LockManager, LockSettings};
use crate::registry::BlockRegistry;
use crate::state::{Checkpoint, ExecutionStateDocument, StateManager};
use crate::storage::{JsonlEventLog, MemoryEventLog, MemoryStore, SharedStore};
use crate::types::{ExecutionId, ExecutionState, TriggerKind, WorkflowId};
use crate::workflow::{BlockRunner, RunError, RunOutcome, WorkflowExecutor};
use crate::workflow_store::WorkflowStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Structured result of one `execute` call. Every entry point returns one of
/// these; no raw error crosses the engine boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_id: ExecutionId,
    pub output: Option<Value>,
    pub error: Option<ErrorResponse>,
    pub state: ExecutionState,
}

/// The workflow execution engine: DAG scheduling, control flow, and the
/// distributed coordination that lets runs behave correctly across
/// processes. Block semantics stay behind the registry; workflow
/// definitions stay behind the workflow store.
pub struct Engine {
    config: Arc<EngineConfig>,
    workflows: Arc<dyn WorkflowStore>,
    events: Arc<dyn EventLog>,
    state: Arc<StateManager>,
    locks: Arc<LockManager>,
    idempotency: Arc<IdempotencyManager>,
    dlq: Arc<DeadLetterQueue>,
    executor: WorkflowExecutor,
}

impl Engine {
    /// Single-instance engine: no shared store, process-local coordination
    /// with explicitly weaker guarantees.
    pub fn new(
        config: EngineConfig,
        registry: Arc<BlockRegistry>,
        workflows: Arc<dyn WorkflowStore>,
    ) -> Result<Self> {
        Self::build(config, registry, workflows, None)
    }

    /// Engine backed by a shared store for cross-process locking, state
    /// mirroring, idempotency and dead letters.
    pub fn with_shared_store(
        config: EngineConfig,
        registry: Arc<BlockRegistry>,
        workflows: Arc<dyn WorkflowStore>,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self> {
        Self::build(config, registry, workflows, Some(store))
    }

    fn build(
        config: EngineConfig,
        registry: Arc<BlockRegistry>,
        workflows: Arc<dyn WorkflowStore>,
        store: Option<Arc<dyn SharedStore>>,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let events: Arc<dyn EventLog> = match &config.event_log_dir {
            Some(dir) => Arc::new(JsonlEventLog::new(dir.clone())?),
            None => Arc::new(MemoryEventLog::new()),
        };

        // Idempotency records and dead letters always need a key-value
        // backing; without a shared store they live in process-local memory.
        let kv: Arc<dyn SharedStore> = store
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let state = Arc::new(StateManager::new(store.clone(), config.state_ttl()));
        let locks = Arc::new(LockManager::new(
            store,
            LockSettings {
                ttl: config.lock_ttl(),
                poll_interval: config.lock_poll_interval(),
                blocking_timeout: config.lock_blocking_timeout(),
            },
        ));
        let idempotency = Arc::new(IdempotencyManager::new(
            kv.clone(),
            config.idempotency_ttl(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(kv));

        let runner = BlockRunner::new(registry, config.clone(), events.clone());
        let executor = WorkflowExecutor::new(runner, state.clone());

        Ok(Self {
            config,
            workflows,
            events,
            state,
            locks,
            idempotency,
            dlq,
            executor,
        })
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn events(&self) -> &Arc<dyn EventLog> {
        &self.events
    }

    /// Run a workflow to completion.
    ///
    /// With an idempotency key, a repeat call within the key's lifetime
    /// returns the stored result (or the in-flight placeholder) without
    /// running any block. The run itself is guarded by the workflow's
    /// execution lock; a contended lock yields a "busy" result the caller
    /// should retry, not a fatal error.
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        user_id: &str,
        trigger: TriggerKind,
        input_data: Value,
        idempotency_key: Option<&str>,
    ) -> ExecutionResult {
        let execution_id = ExecutionId::new();

        if let Some(key) = idempotency_key {
            match self.idempotency.begin(key, execution_id).await {
                Ok(BeginOutcome::Started) => {}
                Ok(BeginOutcome::Duplicate(record)) => return duplicate_result(record),
                Err(err) => {
                    tracing::warn!("Idempotency check failed; continuing without dedup: {}", err);
                }
            }
        }

        let lock_name = execution_lock_name(workflow_id);
        let lock = match self.locks.acquire(&lock_name).await {
            Ok(lock) => lock,
            Err(err) => {
                // Busy (or the store misbehaved): surface a retryable result
                // and free the idempotency key so the retry is not stuck
                // behind our placeholder. No state document exists yet, so
                // nothing lingers for an execution that never started.
                if let Some(key) = idempotency_key {
                    if let Err(abandon_err) = self.idempotency.abandon(key).await {
                        tracing::warn!("Failed to abandon idempotency key: {}", abandon_err);
                    }
                }
                return self.structured_failure(execution_id, err, ExecutionState::Pending);
            }
        };

        self.state
            .create_execution(execution_id, workflow_id.clone(), input_data.clone())
            .await;
        let result = match self
            .state
            .transition(&execution_id, ExecutionState::Queued, "queued for execution")
            .await
        {
            Ok(_) => {
                self.execute_locked(execution_id, workflow_id, user_id, trigger, input_data)
                    .await
            }
            Err(err) => self.structured_failure(execution_id, err, ExecutionState::Pending),
        };

        if let Err(err) = self.locks.release(&lock).await {
            tracing::warn!("Failed to release lock {}: {}", lock_name, err);
        }

        if let Some(key) = idempotency_key {
            match serde_json::to_value(&result) {
                Ok(payload) => {
                    if let Err(err) = self.idempotency.complete(key, execution_id, payload).await {
                        tracing::warn!("Failed to complete idempotency record: {}", err);
                    }
                }
                Err(err) => tracing::warn!("Failed to serialize execution result: {}", err),
            }
        }

        self.state.evict_terminal(&execution_id);
        result
    }

    async fn execute_locked(
        &self,
        execution_id: ExecutionId,
        workflow_id: &WorkflowId,
        user_id: &str,
        trigger: TriggerKind,
        input_data: Value,
    ) -> ExecutionResult {
        let workflow = match self.workflows.get_workflow(workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                let err = EngineError::WorkflowNotFound(workflow_id.0.clone());
                return self
                    .fail_execution(execution_id, workflow_id, &input_data, err, None, None, 0)
                    .await;
            }
            Err(err) => {
                let err = EngineError::Store(err.to_string());
                return self
                    .fail_execution(execution_id, workflow_id, &input_data, err, None, None, 0)
                    .await;
            }
        };

        if let Err(err) = self
            .state
            .transition(&execution_id, ExecutionState::Running, "execution started")
            .await
        {
            return self.structured_failure(execution_id, err, ExecutionState::Queued);
        }
        self.emit(
            execution_id,
            EventType::ExecutionStarted {
                workflow_id: workflow_id.clone(),
                trigger,
            },
        )
        .await;

        let started = Instant::now();
        let mut ctx = ExecutionContext::new(
            execution_id,
            &workflow,
            user_id,
            trigger,
            input_data.clone(),
            std::env::vars().collect(),
        );

        match self.executor.run(&workflow, &mut ctx).await {
            Ok(RunOutcome::Completed { output }) => {
                if let Some(output) = &output {
                    if let Err(err) = self.state.set_output(&execution_id, output.clone()).await {
                        tracing::warn!("Failed to store output for {}: {}", execution_id, err);
                    }
                }

                match self
                    .state
                    .transition(&execution_id, ExecutionState::Completed, "execution completed")
                    .await
                {
                    Ok(_) => {
                        self.emit(
                            execution_id,
                            EventType::ExecutionCompleted {
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                        )
                        .await;
                        ExecutionResult {
                            success: true,
                            execution_id,
                            output,
                            error: None,
                            state: ExecutionState::Completed,
                        }
                    }
                    // A cancel that raced the final block wins: the state
                    // is terminal and the caller sees a cancelled result.
                    Err(EngineError::InvalidStateTransition {
                        from: ExecutionState::Cancelled,
                        ..
                    }) => self.cancelled_result(execution_id).await,
                    Err(err) => self.structured_failure(execution_id, err, ExecutionState::Running),
                }
            }
            Ok(RunOutcome::Cancelled) => self.cancelled_result(execution_id).await,
            Err(run_error) => {
                let RunError {
                    error,
                    block_id,
                    block_type,
                } = run_error;
                self.fail_execution(
                    execution_id,
                    workflow_id,
                    &input_data,
                    error,
                    block_id.map(|b| b.0),
                    block_type,
                    started.elapsed().as_millis() as u64,
                )
                .await
            }
        }
    }

    /// Record a workflow-level failure: terminal state, dead letter, event.
    /// The dead-letter push never masks the original error.
    #[allow(clippy::too_many_arguments)]
    async fn fail_execution(
        &self,
        execution_id: ExecutionId,
        workflow_id: &WorkflowId,
        input_data: &Value,
        error: EngineError,
        block_id: Option<String>,
        block_type: Option<String>,
        duration_ms: u64,
    ) -> ExecutionResult {
        let terminal = match error {
            EngineError::ExecutionTimeout(_) => ExecutionState::Timeout,
            _ => ExecutionState::Failed,
        };
        let message = error.to_string();

        if let Err(err) = self.state.set_error(&execution_id, message.as_str()).await {
            tracing::warn!("Failed to store error for {}: {}", execution_id, err);
        }
        if let Err(err) = self
            .state
            .transition(&execution_id, terminal, message.as_str())
            .await
        {
            tracing::warn!(
                "Failed to transition {} to {}: {}",
                execution_id,
                terminal,
                err
            );
        }

        match terminal {
            ExecutionState::Timeout => {
                self.emit(
                    execution_id,
                    EventType::ExecutionTimedOut {
                        budget_secs: self.config.workflow_timeout_secs,
                    },
                )
                .await
            }
            _ => {
                self.emit(
                    execution_id,
                    EventType::ExecutionFailed {
                        error: message.clone(),
                        duration_ms,
                    },
                )
                .await
            }
        }

        self.dlq
            .push_failure(
                execution_id,
                workflow_id.clone(),
                input_data.clone(),
                message.as_str(),
            )
            .await;
        self.emit(
            execution_id,
            EventType::DeadLettered {
                error: message.clone(),
            },
        )
        .await;

        let mut response = ErrorResponse::from_engine_error(&error);
        response.block_id = block_id;
        response.block_type = block_type;

        ExecutionResult {
            success: false,
            execution_id,
            output: None,
            error: Some(response),
            state: terminal,
        }
    }

    async fn cancelled_result(&self, execution_id: ExecutionId) -> ExecutionResult {
        self.emit(
            execution_id,
            EventType::ExecutionCancelled {
                reason: "cancel observed at scheduler step".to_string(),
            },
        )
        .await;
        ExecutionResult {
            success: false,
            execution_id,
            output: None,
            error: Some(ErrorResponse {
                error: "execution cancelled".to_string(),
                error_type: "cancelled".to_string(),
                block_id: None,
                block_type: None,
            }),
            state: ExecutionState::Cancelled,
        }
    }

    fn structured_failure(
        &self,
        execution_id: ExecutionId,
        error: EngineError,
        state: ExecutionState,
    ) -> ExecutionResult {
        ExecutionResult {
            success: false,
            execution_id,
            output: None,
            error: Some(ErrorResponse::from_engine_error(&error)),
            state,
        }
    }

    /// Request a pause. The running walk observes it at its next scheduler
    /// step; an in-flight block is not preempted.
    pub async fn pause(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionStateDocument, EngineError> {
        self.control_transition(execution_id, ExecutionState::Paused, "pause requested")
            .await
    }

    /// Resume a paused execution, optionally restoring a checkpoint first.
    pub async fn resume(
        &self,
        execution_id: &ExecutionId,
        checkpoint_id: Option<&str>,
    ) -> Result<ExecutionStateDocument, EngineError> {
        if let Some(checkpoint_id) = checkpoint_id {
            let document = self
                .state
                .restore_checkpoint(execution_id, checkpoint_id)
                .await?;
            self.emit(
                *execution_id,
                EventType::CheckpointRestored {
                    checkpoint_id: checkpoint_id.to_string(),
                },
            )
            .await;
            // The snapshot may already be in RUNNING; no further transition
            // is needed (or legal) in that case.
            if document.state == ExecutionState::Running {
                return Ok(document);
            }
        }
        self.control_transition(execution_id, ExecutionState::Running, "resumed")
            .await
    }

    /// Request cancellation. Cooperative: takes effect at the next scheduler
    /// step of the running walk.
    pub async fn cancel(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionStateDocument, EngineError> {
        let document = self
            .control_transition(execution_id, ExecutionState::Cancelled, "cancel requested")
            .await?;
        self.emit(
            *execution_id,
            EventType::ExecutionCancelled {
                reason: "cancel requested".to_string(),
            },
        )
        .await;
        Ok(document)
    }

    /// Snapshot the execution's distributed state under a name.
    pub async fn checkpoint(
        &self,
        execution_id: &ExecutionId,
        name: &str,
    ) -> Result<Checkpoint, EngineError> {
        let checkpoint = self.state.create_checkpoint(execution_id, name).await?;
        self.emit(
            *execution_id,
            EventType::CheckpointCreated {
                checkpoint_id: checkpoint.id.clone(),
                name: name.to_string(),
            },
        )
        .await;
        Ok(checkpoint)
    }

    async fn control_transition(
        &self,
        execution_id: &ExecutionId,
        to: ExecutionState,
        reason: &str,
    ) -> Result<ExecutionStateDocument, EngineError> {
        let before = self
            .state
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        let document = self.state.transition(execution_id, to, reason).await?;
        self.emit(
            *execution_id,
            EventType::StateTransitioned {
                from: before.state,
                to,
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(document)
    }

    async fn emit(&self, execution_id: ExecutionId, event_type: EventType) {
        let event = ExecutionEvent::new(execution_id, event_type);
        if let Err(err) = self.events.append(event).await {
            tracing::warn!("Failed to append execution event: {}", err);
        }
    }
}

/// Build the caller-facing result for a duplicated idempotency key.
fn duplicate_result(record: IdempotencyRecord) -> ExecutionResult {
    if record.status == IdempotencyStatus::Completed {
        if let Some(response) = &record.response {
            if let Ok(result) = serde_json::from_value::<ExecutionResult>(response.clone()) {
                return result;
            }
        }
    }
    // In-flight placeholder: the original run has not finished yet.
    ExecutionResult {
        success: false,
        execution_id: record.execution_id,
        output: None,
        error: Some(ErrorResponse {
            error: "an execution with this idempotency key is already in flight".to_string(),
            error_type: "duplicate_request".to_string(),
            block_id: None,
            block_type: None,
        }),
        state: ExecutionState::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockError, BlockExecutor, BlockInputs, BlockOutputs};
    use crate::lock::LockSettings;
    use crate::types::{Block, BlockId, Edge};
    use crate::workflow_store::MemoryWorkflowStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBlock {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BlockExecutor for CountingBlock {
        fn type_tag(&self) -> &str {
            "counting"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut outputs = BlockOutputs::new();
            outputs.insert("calls".to_string(), json!(count));
            Ok(outputs)
        }
    }

    struct SleepyBlock {
        millis: u64,
    }

    #[async_trait::async_trait]
    impl BlockExecutor for SleepyBlock {
        fn type_tag(&self) -> &str {
            "sleepy"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(BlockOutputs::new())
        }
    }

    struct BrokenBlock;

    #[async_trait::async_trait]
    impl BlockExecutor for BrokenBlock {
        fn type_tag(&self) -> &str {
            "broken"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            Err(BlockError::Execution("invalid upstream payload".to_string()))
        }
    }

    fn block(id: &str, block_type: &str) -> Block {
        Block {
            id: BlockId::new(id),
            block_type: block_type.to_string(),
            config: Value::Null,
            inputs: serde_json::Map::new(),
            input_schema: vec![],
            output_schema: vec![],
        }
    }

    fn chain_workflow(id: &str, blocks: Vec<Block>) -> crate::types::WorkflowDefinition {
        let edges = blocks
            .windows(2)
            .map(|pair| Edge {
                source: pair[0].id.clone(),
                target: pair[1].id.clone(),
                source_handle: None,
            })
            .collect();
        crate::types::WorkflowDefinition {
            id: WorkflowId::new(id),
            name: id.to_string(),
            blocks,
            edges,
        }
    }

    struct TestRig {
        engine: Arc<Engine>,
        store: Arc<MemoryStore>,
        calls: Arc<AtomicUsize>,
    }

    fn rig(config: EngineConfig, workflows: Vec<crate::types::WorkflowDefinition>) -> TestRig {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("cascade_engine=debug")
            .try_init();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut registry = BlockRegistry::new();
        registry.register("counting", move || {
            Arc::new(CountingBlock {
                calls: calls_clone.clone(),
            })
        });
        registry.register("sleepy", || Arc::new(SleepyBlock { millis: 150 }));
        registry.register("broken", || Arc::new(BrokenBlock));

        let workflow_store = Arc::new(MemoryWorkflowStore::new());
        for workflow in workflows {
            workflow_store.insert(workflow);
        }

        let store = Arc::new(MemoryStore::new());
        let engine = Engine::with_shared_store(
            config,
            Arc::new(registry),
            workflow_store,
            store.clone(),
        )
        .unwrap();

        TestRig {
            engine: Arc::new(engine),
            store,
            calls,
        }
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 1,
            lock_poll_interval_ms: 5,
            lock_blocking_timeout_secs: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn successful_run_returns_output_and_completed_state() {
        let rig = rig(
            quick_config(),
            vec![chain_workflow("wf", vec![block("a", "counting")])],
        );

        let result = rig
            .engine
            .execute(
                &WorkflowId::new("wf"),
                "user-1",
                TriggerKind::Api,
                json!({"n": 1}),
                None,
            )
            .await;

        assert!(result.success, "unexpected error: {:?}", result.error);
        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.output, Some(json!({"calls": 1})));

        // document survived in the shared store past local eviction
        let document = rig
            .engine
            .state()
            .get(&result.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document.state, ExecutionState::Completed);
        assert_eq!(document.output_data, Some(json!({"calls": 1})));
    }

    #[tokio::test]
    async fn idempotent_calls_share_one_run_and_one_result() {
        let rig = rig(
            quick_config(),
            vec![chain_workflow("wf", vec![block("a", "counting")])],
        );

        let first = rig
            .engine
            .execute(
                &WorkflowId::new("wf"),
                "user-1",
                TriggerKind::Api,
                json!({}),
                Some("req-42"),
            )
            .await;
        let second = rig
            .engine
            .execute(
                &WorkflowId::new("wf"),
                "user-1",
                TriggerKind::Api,
                json!({}),
                Some("req-42"),
            )
            .await;

        assert!(first.success && second.success);
        assert_eq!(first.execution_id, second.execution_id);
        assert_eq!(first.output, second.output);
        assert_eq!(rig.calls.load(Ordering::SeqCst), 1, "blocks ran twice");
    }

    #[tokio::test]
    async fn failed_run_is_dead_lettered_with_block_context() {
        let rig = rig(
            quick_config(),
            vec![chain_workflow(
                "wf",
                vec![block("a", "counting"), block("bad", "broken")],
            )],
        );

        let input = json!({"payload": "x"});
        let result = rig
            .engine
            .execute(
                &WorkflowId::new("wf"),
                "user-1",
                TriggerKind::Webhook,
                input.clone(),
                None,
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.state, ExecutionState::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.block_id.as_deref(), Some("bad"));
        assert_eq!(error.block_type.as_deref(), Some("broken"));

        let letters = rig.engine.dead_letters().list().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].execution_id, result.execution_id);
        assert_eq!(letters[0].input_data, input);
    }

    #[tokio::test]
    async fn unknown_workflow_is_a_structured_failure() {
        let rig = rig(quick_config(), vec![]);
        let result = rig
            .engine
            .execute(
                &WorkflowId::new("ghost"),
                "user-1",
                TriggerKind::Api,
                Value::Null,
                None,
            )
            .await;

        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().error_type,
            "workflow_not_found".to_string()
        );
    }

    #[tokio::test]
    async fn contended_lock_yields_busy_and_frees_the_idempotency_key() {
        let rig = rig(
            quick_config(),
            vec![chain_workflow("wf", vec![block("a", "counting")])],
        );

        // hold the execution lock from "another process"
        let foreign = LockManager::new(
            Some(rig.store.clone() as Arc<dyn SharedStore>),
            LockSettings {
                ttl: Duration::from_secs(30),
                poll_interval: Duration::from_millis(5),
                blocking_timeout: Duration::from_millis(50),
            },
        );
        let held = foreign
            .acquire(&execution_lock_name(&WorkflowId::new("wf")))
            .await
            .unwrap();

        let result = rig
            .engine
            .execute(
                &WorkflowId::new("wf"),
                "user-1",
                TriggerKind::Api,
                Value::Null,
                Some("req-busy"),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().error_type, "lock_acquisition");
        assert_eq!(rig.calls.load(Ordering::SeqCst), 0);

        foreign.release(&held).await.unwrap();

        // the key was abandoned, so the retry actually runs
        let retry = rig
            .engine
            .execute(
                &WorkflowId::new("wf"),
                "user-1",
                TriggerKind::Api,
                Value::Null,
                Some("req-busy"),
            )
            .await;
        assert!(retry.success);
        assert_eq!(rig.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_during_a_run_stops_at_the_next_step() {
        let rig = rig(
            quick_config(),
            vec![chain_workflow(
                "wf",
                vec![block("s1", "sleepy"), block("s2", "sleepy")],
            )],
        );

        let engine = rig.engine.clone();
        let run = tokio::spawn(async move {
            engine
                .execute(
                    &WorkflowId::new("wf"),
                    "user-1",
                    TriggerKind::Api,
                    Value::Null,
                    None,
                )
                .await
        });

        // let the first block start, then cancel
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut cancelled = false;
        for _ in 0..20 {
            let letters = rig.store.scan_prefix("execution:state:").await.unwrap();
            if let Some((_, raw)) = letters.first() {
                let document: ExecutionStateDocument = serde_json::from_str(raw).unwrap();
                if document.state == ExecutionState::Running {
                    rig.engine.cancel(&document.execution_id).await.unwrap();
                    cancelled = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cancelled, "never saw a running execution to cancel");

        let result = run.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.state, ExecutionState::Cancelled);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip_through_the_state_machine() {
        let rig = rig(
            quick_config(),
            vec![chain_workflow("wf", vec![block("a", "counting")])],
        );

        // drive a standalone execution document through pause/resume
        let execution_id = ExecutionId::new();
        rig.engine
            .state()
            .create_execution(execution_id, WorkflowId::new("wf"), Value::Null)
            .await;
        rig.engine
            .state()
            .transition(&execution_id, ExecutionState::Queued, "queued")
            .await
            .unwrap();
        rig.engine
            .state()
            .transition(&execution_id, ExecutionState::Running, "started")
            .await
            .unwrap();

        let paused = rig.engine.pause(&execution_id).await.unwrap();
        assert_eq!(paused.state, ExecutionState::Paused);

        let resumed = rig.engine.resume(&execution_id, None).await.unwrap();
        assert_eq!(resumed.state, ExecutionState::Running);

        // resume with a checkpoint restores the snapshot first
        let checkpoint = rig.engine.checkpoint(&execution_id, "mid-run").await.unwrap();
        rig.engine.pause(&execution_id).await.unwrap();
        let restored = rig
            .engine
            .resume(&execution_id, Some(&checkpoint.id))
            .await
            .unwrap();
        assert_eq!(restored.state, ExecutionState::Running);
        assert_eq!(
            restored.metadata.get("restored_from"),
            Some(&Value::String(checkpoint.id))
        );
    }

    #[tokio::test]
    async fn pause_of_unknown_execution_is_not_found() {
        let rig = rig(quick_config(), vec![]);
        let err = rig.engine.pause(&ExecutionId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::ExecutionNotFound(_)));
    }
}
