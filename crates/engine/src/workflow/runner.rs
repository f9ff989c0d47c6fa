use crate::block::{BlockError, BlockInputs};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::is_recoverable_message;
use crate::events::{EventLog, EventType, ExecutionEvent};
use crate::registry::BlockRegistry;
use crate::template;
use crate::types::{Block, BlockOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

pub const ERROR_TYPE_VALIDATION: &str = "validation";
pub const ERROR_TYPE_EXECUTION: &str = "block_execution";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout";

/// Wraps every block call in the engine's error-handling policy: input and
/// config validation, per-block and whole-run timeouts, bounded fixed-delay
/// retry for recoverable failures, and a uniform structured outcome. No
/// error from a block body ever crosses the scheduler boundary.
#[derive(Clone)]
pub struct BlockRunner {
    registry: Arc<BlockRegistry>,
    config: Arc<EngineConfig>,
    events: Arc<dyn EventLog>,
}

impl BlockRunner {
    pub fn new(
        registry: Arc<BlockRegistry>,
        config: Arc<EngineConfig>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            registry,
            config,
            events,
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Execute one block and return its structured outcome. Appends exactly
    /// one log entry to the context per invocation, regardless of outcome,
    /// and records the block's terminal state.
    ///
    /// `deadline` is the whole-run budget; each attempt's timeout is the
    /// smaller of the per-block budget and what remains of the run.
    pub async fn execute_with_error_handling(
        &self,
        block: &Block,
        ctx: &mut ExecutionContext,
        deadline: Instant,
    ) -> BlockOutcome {
        let started_at = Utc::now();
        let started = Instant::now();

        let outcome = self.run_attempts(block, ctx, deadline, started).await;

        let ended_at = Utc::now();
        ctx.apply_outcome(block, &outcome, started_at, ended_at);
        outcome
    }

    async fn run_attempts(
        &self,
        block: &Block,
        ctx: &mut ExecutionContext,
        deadline: Instant,
        started: Instant,
    ) -> BlockOutcome {
        let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

        let executor = match self.registry.create(&block.block_type) {
            Ok(executor) => executor,
            Err(err) => {
                tracing::error!("Block {} has unknown type: {}", block.id, block.block_type);
                return BlockOutcome::failed(
                    err.to_string(),
                    ERROR_TYPE_VALIDATION,
                    elapsed_ms(started),
                );
            }
        };

        if let Err(err) = executor.validate_config(&block.config) {
            return BlockOutcome::failed(
                err.to_string(),
                ERROR_TYPE_VALIDATION,
                elapsed_ms(started),
            );
        }

        let inputs = template::resolve_inputs(&block.inputs, ctx);
        if let Err(message) = validate_required_inputs(block, executor.required_inputs(), &inputs) {
            return BlockOutcome::failed(message, ERROR_TYPE_VALIDATION, elapsed_ms(started));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return BlockOutcome::failed(
                    "workflow execution budget exhausted",
                    ERROR_TYPE_TIMEOUT,
                    elapsed_ms(started),
                );
            }

            self.emit(
                ctx,
                EventType::BlockStarted {
                    block_id: block.id.clone(),
                    attempt,
                },
            )
            .await;

            let budget = self.config.block_timeout().min(remaining);
            let attempt_result =
                tokio::time::timeout(budget, executor.execute(&inputs, ctx)).await;

            let (error, error_type) = match attempt_result {
                Ok(Ok(outputs)) => {
                    let duration_ms = elapsed_ms(started);
                    self.emit(
                        ctx,
                        EventType::BlockCompleted {
                            block_id: block.id.clone(),
                            duration_ms,
                        },
                    )
                    .await;
                    return BlockOutcome::succeeded(outputs, duration_ms);
                }
                Ok(Err(BlockError::Validation(message))) => (message, ERROR_TYPE_VALIDATION),
                Ok(Err(BlockError::Execution(message))) => (message, ERROR_TYPE_EXECUTION),
                Err(_) => (
                    format!("block timed out after {}s", budget.as_secs()),
                    ERROR_TYPE_TIMEOUT,
                ),
            };

            let recoverable = match error_type {
                ERROR_TYPE_VALIDATION => false,
                ERROR_TYPE_TIMEOUT => true,
                _ => is_recoverable_message(&error),
            };
            let will_retry = recoverable
                && attempt < max_attempts
                && deadline.saturating_duration_since(Instant::now()) > self.config.retry_delay();

            self.emit(
                ctx,
                EventType::BlockFailed {
                    block_id: block.id.clone(),
                    error: error.clone(),
                    attempt,
                    will_retry,
                },
            )
            .await;

            if !will_retry {
                return BlockOutcome::failed(error, error_type, elapsed_ms(started));
            }

            tracing::info!(
                "Retrying block {} after {:?} (attempt {})",
                block.id,
                self.config.retry_delay(),
                attempt + 1
            );
            tokio::time::sleep(self.config.retry_delay()).await;
            attempt += 1;
        }
    }

    async fn emit(&self, ctx: &ExecutionContext, event_type: EventType) {
        let event = ExecutionEvent::new(ctx.execution_id, event_type);
        if let Err(err) = self.events.append(event).await {
            tracing::warn!("Failed to append execution event: {}", err);
        }
    }
}

fn validate_required_inputs(
    block: &Block,
    executor_required: &[&str],
    inputs: &BlockInputs,
) -> Result<(), String> {
    let declared = block.input_schema.iter().map(String::as_str);
    for name in declared.chain(executor_required.iter().copied()) {
        match inputs.get(name) {
            Some(value) if !value.is_null() => {}
            _ => return Err(format!("missing required input: {}", name)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockExecutor, BlockOutputs};
    use crate::storage::MemoryEventLog;
    use crate::types::{
        BlockId, ExecutionId, TriggerKind, WorkflowDefinition, WorkflowId,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct EchoBlock;

    #[async_trait::async_trait]
    impl BlockExecutor for EchoBlock {
        fn type_tag(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            Ok(inputs.clone())
        }
    }

    struct FlakyBlock {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait::async_trait]
    impl BlockExecutor for FlakyBlock {
        fn type_tag(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(BlockOutputs::new())
            } else {
                Err(BlockError::Execution("connection refused".to_string()))
            }
        }
    }

    struct RejectingBlock;

    #[async_trait::async_trait]
    impl BlockExecutor for RejectingBlock {
        fn type_tag(&self) -> &str {
            "rejecting"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            Err(BlockError::Validation("bad payload".to_string()))
        }
    }

    struct SlowBlock;

    #[async_trait::async_trait]
    impl BlockExecutor for SlowBlock {
        fn type_tag(&self) -> &str {
            "slow"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            _ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(BlockOutputs::new())
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

    fn context_for(blocks: &[Block]) -> ExecutionContext {
        let workflow = WorkflowDefinition {
            id: WorkflowId::new("wf"),
            name: "t".to_string(),
            blocks: blocks.to_vec(),
            edges: vec![],
        };
        ExecutionContext::new(
            ExecutionId::new(),
            &workflow,
            "user",
            TriggerKind::Api,
            Value::Null,
            HashMap::new(),
        )
    }

    fn runner_with(config: EngineConfig, register: impl FnOnce(&mut BlockRegistry)) -> BlockRunner {
        let mut registry = BlockRegistry::new();
        register(&mut registry);
        BlockRunner::new(
            Arc::new(registry),
            Arc::new(config),
            Arc::new(MemoryEventLog::new()),
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(600)
    }

    #[tokio::test]
    async fn success_produces_outputs_and_one_log_entry() {
        let runner = runner_with(EngineConfig::default(), |r| {
            r.register("echo", || Arc::new(EchoBlock))
        });
        let mut b = block("a", "echo");
        b.inputs.insert("value".to_string(), json!(42));
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, far_deadline())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.outputs.get("value"), Some(&json!(42)));
        assert_eq!(ctx.logs.len(), 1);
        assert!(ctx.block_states[&b.id].executed);
    }

    #[tokio::test]
    async fn recoverable_failure_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let config = EngineConfig {
            max_attempts: 3,
            retry_delay_ms: 1,
            ..EngineConfig::default()
        };
        let runner = runner_with(config, move |r| {
            r.register("flaky", move || {
                Arc::new(FlakyBlock {
                    calls: calls_clone.clone(),
                    succeed_on: 3,
                })
            })
        });
        let b = block("a", "flaky");
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, far_deadline())
            .await;

        assert!(outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // retries are one invocation: one log entry
        assert_eq!(ctx.logs.len(), 1);
    }

    #[tokio::test]
    async fn validation_failures_are_never_retried() {
        let config = EngineConfig {
            max_attempts: 5,
            retry_delay_ms: 1,
            ..EngineConfig::default()
        };
        let runner = runner_with(config, |r| {
            r.register("rejecting", || Arc::new(RejectingBlock))
        });
        let b = block("a", "rejecting");
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, far_deadline())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_type.as_deref(), Some(ERROR_TYPE_VALIDATION));
        assert_eq!(ctx.logs.len(), 1);
        assert!(!ctx.logs[0].success);
    }

    #[tokio::test]
    async fn missing_required_input_fails_before_invocation() {
        let runner = runner_with(EngineConfig::default(), |r| {
            r.register("echo", || Arc::new(EchoBlock))
        });
        let mut b = block("a", "echo");
        b.input_schema = vec!["url".to_string()];
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, far_deadline())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_type.as_deref(), Some(ERROR_TYPE_VALIDATION));
        assert!(outcome.error.unwrap().contains("url"));
    }

    #[tokio::test]
    async fn block_timeout_yields_timeout_outcome() {
        let config = EngineConfig {
            block_timeout_secs: 1,
            max_attempts: 1,
            ..EngineConfig::default()
        };
        let runner = runner_with(config, |r| r.register("slow", || Arc::new(SlowBlock)));
        let b = block("a", "slow");
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, far_deadline())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_type.as_deref(), Some(ERROR_TYPE_TIMEOUT));
    }

    #[tokio::test]
    async fn exhausted_workflow_budget_fails_without_invoking() {
        let runner = runner_with(EngineConfig::default(), |r| {
            r.register("echo", || Arc::new(EchoBlock))
        });
        let b = block("a", "echo");
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, Instant::now())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_type.as_deref(), Some(ERROR_TYPE_TIMEOUT));
    }

    #[tokio::test]
    async fn unknown_block_type_is_a_structured_failure() {
        let runner = runner_with(EngineConfig::default(), |_| {});
        let b = block("a", "mystery");
        let mut ctx = context_for(std::slice::from_ref(&b));

        let outcome = runner
            .execute_with_error_handling(&b, &mut ctx, far_deadline())
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("mystery"));
    }
}
