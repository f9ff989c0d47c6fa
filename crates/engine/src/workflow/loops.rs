use crate::context::{ExecutionContext, VariableOverlay};
use crate::template;
use crate::types::{Block, BlockId, BlockOutcome, WorkflowDefinition};
use crate::workflow::runner::{BlockRunner, ERROR_TYPE_VALIDATION};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;

/// How a loop or parallel block derives its iteration plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IterationMode {
    #[serde(rename = "for")]
    For,
    #[serde(rename = "forEach")]
    ForEach,
}

/// Static configuration of a loop block
#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    pub mode: IterationMode,
    #[serde(default)]
    pub count: Option<u64>,
    /// Literal array, or a `{{variable}}` template resolving to one.
    #[serde(default)]
    pub collection: Option<Value>,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    /// Blocks forming the loop body, run once per iteration in this order.
    #[serde(default)]
    pub body: Vec<BlockId>,
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

/// One precomputed entry of an iteration plan
#[derive(Debug, Clone)]
pub struct Iteration {
    pub index: usize,
    pub item: Option<Value>,
}

/// Precompute the full iteration list before any body block runs: a fixed
/// count for `for`, one entry per collection item for `forEach`.
pub fn build_iterations(
    mode: IterationMode,
    count: Option<u64>,
    collection: Option<&Value>,
    ctx: &ExecutionContext,
) -> Result<Vec<Iteration>, String> {
    match mode {
        IterationMode::For => {
            let count = count.ok_or("a fixed count is required for mode \"for\"")?;
            Ok((0..count as usize)
                .map(|index| Iteration { index, item: None })
                .collect())
        }
        IterationMode::ForEach => {
            let raw = collection.ok_or("a collection is required for mode \"forEach\"")?;
            let resolved = template::resolve_value(raw, ctx);
            let items = resolved
                .as_array()
                .ok_or("loop collection must resolve to an array")?;
            Ok(items
                .iter()
                .enumerate()
                .map(|(index, item)| Iteration {
                    index,
                    item: Some(item.clone()),
                })
                .collect())
        }
    }
}

/// Look up the body blocks of a loop/parallel configuration.
pub fn resolve_body<'a>(
    workflow: &'a WorkflowDefinition,
    body: &[BlockId],
) -> Result<Vec<&'a Block>, String> {
    body.iter()
        .map(|id| {
            workflow
                .block(id)
                .ok_or_else(|| format!("body references unknown block {}", id))
        })
        .collect()
}

/// Run a loop block: precompute iterations, run the body per iteration with
/// iteration-scoped variables overlaid, and restore the namespace on every
/// exit path. A failing iteration is recorded and the remaining iterations
/// still run; the aggregate reports success/failure counts.
pub async fn run_loop(
    runner: &BlockRunner,
    workflow: &WorkflowDefinition,
    block: &Block,
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> BlockOutcome {
    let started_at = Utc::now();
    let started = Instant::now();

    let finish = |ctx: &mut ExecutionContext, outcome: BlockOutcome| {
        ctx.apply_outcome(block, &outcome, started_at, Utc::now());
        outcome
    };

    let config: LoopConfig = match serde_json::from_value(block.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            return finish(
                ctx,
                BlockOutcome::failed(
                    format!("invalid loop configuration: {}", err),
                    ERROR_TYPE_VALIDATION,
                    started.elapsed().as_millis() as u64,
                ),
            );
        }
    };

    let body = match resolve_body(workflow, &config.body) {
        Ok(body) => body.into_iter().cloned().collect::<Vec<_>>(),
        Err(message) => {
            return finish(
                ctx,
                BlockOutcome::failed(
                    message,
                    ERROR_TYPE_VALIDATION,
                    started.elapsed().as_millis() as u64,
                ),
            );
        }
    };

    let iterations = match build_iterations(
        config.mode,
        config.count,
        config.collection.as_ref(),
        ctx,
    ) {
        Ok(iterations) => iterations,
        Err(message) => {
            return finish(
                ctx,
                BlockOutcome::failed(
                    message,
                    ERROR_TYPE_VALIDATION,
                    started.elapsed().as_millis() as u64,
                ),
            );
        }
    };

    let mut records = Vec::with_capacity(iterations.len());
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for iteration in &iterations {
        let mut scoped = vec![(config.index_variable.clone(), json!(iteration.index))];
        if let Some(item) = &iteration.item {
            scoped.push((config.item_variable.clone(), item.clone()));
        }
        let overlay = VariableOverlay::apply(ctx, scoped);

        let mut iteration_error: Option<(String, Option<String>)> = None;
        let mut last_outputs = serde_json::Map::new();
        for body_block in &body {
            let outcome = runner
                .execute_with_error_handling(body_block, ctx, deadline)
                .await;
            if outcome.success {
                last_outputs = outcome.outputs;
            } else {
                iteration_error = Some((
                    outcome
                        .error
                        .unwrap_or_else(|| "block failed".to_string()),
                    outcome.error_type,
                ));
                break;
            }
        }

        // Restored even when the iteration failed, so nothing leaks across
        // iterations or into sibling loops.
        overlay.restore(ctx);

        match iteration_error {
            None => {
                succeeded += 1;
                records.push(json!({
                    "index": iteration.index,
                    "success": true,
                    "outputs": Value::Object(last_outputs),
                }));
            }
            Some((error, error_type)) => {
                failed += 1;
                tracing::warn!(
                    "Loop {} iteration {} failed: {}",
                    block.id,
                    iteration.index,
                    error
                );
                records.push(json!({
                    "index": iteration.index,
                    "success": false,
                    "error": error,
                    "error_type": error_type,
                }));
            }
        }

        ctx.loop_iterations
            .insert(block.id.clone(), iteration.index + 1);
    }

    let mut aggregate = serde_json::Map::new();
    aggregate.insert("count".to_string(), json!(iterations.len()));
    aggregate.insert("succeeded".to_string(), json!(succeeded));
    aggregate.insert("failed".to_string(), json!(failed));
    aggregate.insert("results".to_string(), Value::Array(records));

    finish(
        ctx,
        BlockOutcome::succeeded(aggregate, started.elapsed().as_millis() as u64),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockError, BlockExecutor, BlockInputs, BlockOutputs};
    use crate::config::EngineConfig;
    use crate::registry::BlockRegistry;
    use crate::storage::MemoryEventLog;
    use crate::types::{ExecutionId, TriggerKind, WorkflowId};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records the value of a context variable each time it runs.
    struct ProbeBlock {
        variable: String,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait::async_trait]
    impl BlockExecutor for ProbeBlock {
        fn type_tag(&self) -> &str {
            "probe"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            let value = ctx
                .get_variable(&self.variable)
                .cloned()
                .unwrap_or(Value::Null);
            self.seen.lock().unwrap().push(value.clone());
            let mut outputs = BlockOutputs::new();
            outputs.insert("seen".to_string(), value);
            Ok(outputs)
        }
    }

    struct FailOnIndex {
        fail_index: i64,
    }

    #[async_trait::async_trait]
    impl BlockExecutor for FailOnIndex {
        fn type_tag(&self) -> &str {
            "fail_on_index"
        }

        async fn execute(
            &self,
            _inputs: &BlockInputs,
            ctx: &mut ExecutionContext,
        ) -> Result<BlockOutputs, BlockError> {
            let index = ctx
                .get_variable("index")
                .and_then(|v| v.as_i64())
                .unwrap_or(-1);
            if index == self.fail_index {
                Err(BlockError::Execution("deliberate failure".to_string()))
            } else {
                Ok(BlockOutputs::new())
            }
        }
    }

    fn body_block(id: &str, block_type: &str) -> Block {
        Block {
            id: BlockId::new(id),
            block_type: block_type.to_string(),
            config: Value::Null,
            inputs: serde_json::Map::new(),
            input_schema: vec![],
            output_schema: vec![],
        }
    }

    fn loop_block(config: Value) -> Block {
        Block {
            id: BlockId::new("loop"),
            block_type: "loop".to_string(),
            config,
            inputs: serde_json::Map::new(),
            input_schema: vec![],
            output_schema: vec![],
        }
    }

    fn setup(
        loop_config: Value,
        body: Vec<Block>,
        register: impl FnOnce(&mut BlockRegistry),
    ) -> (BlockRunner, WorkflowDefinition, ExecutionContext) {
        let mut registry = BlockRegistry::new();
        register(&mut registry);
        let runner = BlockRunner::new(
            Arc::new(registry),
            Arc::new(EngineConfig {
                retry_delay_ms: 1,
                ..EngineConfig::default()
            }),
            Arc::new(MemoryEventLog::new()),
        );

        let mut blocks = vec![loop_block(loop_config)];
        blocks.extend(body);
        let workflow = WorkflowDefinition {
            id: WorkflowId::new("wf"),
            name: "t".to_string(),
            blocks,
            edges: vec![],
        };
        let ctx = ExecutionContext::new(
            ExecutionId::new(),
            &workflow,
            "user",
            TriggerKind::Api,
            Value::Null,
            HashMap::new(),
        );
        (runner, workflow, ctx)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(600)
    }

    #[tokio::test]
    async fn for_each_binds_each_item_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let (runner, workflow, mut ctx) = setup(
            json!({
                "mode": "forEach",
                "collection": [1, 2, 3],
                "item_variable": "x",
                "body": ["probe"],
            }),
            vec![body_block("probe", "probe")],
            move |r| {
                r.register("probe", move || {
                    Arc::new(ProbeBlock {
                        variable: "x".to_string(),
                        seen: seen_clone.clone(),
                    })
                })
            },
        );

        let block = workflow.block(&BlockId::new("loop")).unwrap().clone();
        let outcome = run_loop(&runner, &workflow, &block, &mut ctx, deadline()).await;

        assert!(outcome.success);
        assert_eq!(outcome.outputs.get("count"), Some(&json!(3)));
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(ctx.loop_iterations[&BlockId::new("loop")], 3);
    }

    #[tokio::test]
    async fn empty_collection_yields_zero_count_without_error() {
        let (runner, workflow, mut ctx) = setup(
            json!({"mode": "forEach", "collection": [], "body": []}),
            vec![],
            |_| {},
        );
        let block = workflow.block(&BlockId::new("loop")).unwrap().clone();

        let outcome = run_loop(&runner, &workflow, &block, &mut ctx, deadline()).await;

        assert!(outcome.success);
        assert_eq!(outcome.outputs.get("count"), Some(&json!(0)));
        assert_eq!(outcome.outputs.get("results"), Some(&json!([])));
    }

    #[tokio::test]
    async fn failing_iteration_does_not_abort_the_rest() {
        let (runner, workflow, mut ctx) = setup(
            json!({"mode": "for", "count": 3, "body": ["worker"]}),
            vec![body_block("worker", "fail_on_index")],
            |r| r.register("fail_on_index", || Arc::new(FailOnIndex { fail_index: 1 })),
        );
        let block = workflow.block(&BlockId::new("loop")).unwrap().clone();

        let outcome = run_loop(&runner, &workflow, &block, &mut ctx, deadline()).await;

        assert!(outcome.success);
        assert_eq!(outcome.outputs.get("count"), Some(&json!(3)));
        assert_eq!(outcome.outputs.get("succeeded"), Some(&json!(2)));
        assert_eq!(outcome.outputs.get("failed"), Some(&json!(1)));
        let results = outcome.outputs.get("results").unwrap().as_array().unwrap();
        assert_eq!(results[1]["success"], json!(false));
    }

    #[tokio::test]
    async fn variables_are_restored_even_after_failures() {
        let (runner, workflow, mut ctx) = setup(
            json!({"mode": "for", "count": 2, "item_variable": "x", "body": ["worker"]}),
            vec![body_block("worker", "fail_on_index")],
            |r| r.register("fail_on_index", || Arc::new(FailOnIndex { fail_index: 0 })),
        );
        ctx.set_variable("index", json!("outer"));
        let before = ctx.workflow_variables.clone();
        let block = workflow.block(&BlockId::new("loop")).unwrap().clone();

        run_loop(&runner, &workflow, &block, &mut ctx, deadline()).await;

        assert_eq!(ctx.workflow_variables, before, "loop leaked variables");
    }

    #[tokio::test]
    async fn collection_can_come_from_a_template() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let (runner, workflow, mut ctx) = setup(
            json!({
                "mode": "forEach",
                "collection": "{{items}}",
                "body": ["probe"],
            }),
            vec![body_block("probe", "probe")],
            move |r| {
                r.register("probe", move || {
                    Arc::new(ProbeBlock {
                        variable: "item".to_string(),
                        seen: seen_clone.clone(),
                    })
                })
            },
        );
        ctx.set_variable("items", json!(["a", "b"]));
        let block = workflow.block(&BlockId::new("loop")).unwrap().clone();

        let outcome = run_loop(&runner, &workflow, &block, &mut ctx, deadline()).await;

        assert!(outcome.success);
        assert_eq!(*seen.lock().unwrap(), vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn missing_count_is_a_validation_failure() {
        let (runner, workflow, mut ctx) =
            setup(json!({"mode": "for", "body": []}), vec![], |_| {});
        let block = workflow.block(&BlockId::new("loop")).unwrap().clone();

        let outcome = run_loop(&runner, &workflow, &block, &mut ctx, deadline()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_type.as_deref(), Some(ERROR_TYPE_VALIDATION));
    }
}
