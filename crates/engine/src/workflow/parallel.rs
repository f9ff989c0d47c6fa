use crate::context::{ExecutionContext, ParallelTracker};
use crate::types::{Block, BlockId, BlockLog, BlockOutcome, WorkflowDefinition};
use crate::workflow::loops::{build_iterations, resolve_body, IterationMode};
use crate::workflow::runner::{BlockRunner, ERROR_TYPE_VALIDATION};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// How branch results are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Branch-index order preserved regardless of completion order.
    #[default]
    Array,
    /// Shallow merge; later branch indices overwrite colliding keys.
    Merge,
    /// Keep only the first branch's result, discard the rest.
    First,
}

/// Static configuration of a parallel block
#[derive(Debug, Clone, Deserialize)]
pub struct ParallelConfig {
    pub mode: IterationMode,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub collection: Option<Value>,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    #[serde(default)]
    pub aggregation: AggregationPolicy,
    /// Override of the engine-wide branch concurrency cap.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub body: Vec<BlockId>,
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

struct BranchResult {
    index: usize,
    success: bool,
    outputs: serde_json::Map<String, Value>,
    error: Option<String>,
    error_type: Option<String>,
    logs: Vec<BlockLog>,
}

/// Run a parallel block: precompute the branch list, run branches
/// concurrently under a bounded semaphore, and aggregate the results.
///
/// Each branch executes on its own context snapshot, so the parent variable
/// namespace is untouched afterwards. A branch failure is recorded and never
/// cancels its siblings. Branch logs are appended to the parent in
/// branch-index order once all branches finish.
pub async fn run_parallel(
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

    let config: ParallelConfig = match serde_json::from_value(block.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            return finish(
                ctx,
                BlockOutcome::failed(
                    format!("invalid parallel configuration: {}", err),
                    ERROR_TYPE_VALIDATION,
                    started.elapsed().as_millis() as u64,
                ),
            );
        }
    };

    let body: Vec<Block> = match resolve_body(workflow, &config.body) {
        Ok(body) => body.into_iter().cloned().collect(),
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

    let branches = match build_iterations(
        config.mode,
        config.count,
        config.collection.as_ref(),
        ctx,
    ) {
        Ok(branches) => branches,
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

    let limit = config
        .max_concurrency
        .unwrap_or(runner.config().max_parallel_branches)
        .max(1);
    let semaphore = Arc::new(Semaphore::new(limit));

    let mut handles = Vec::with_capacity(branches.len());
    for branch in &branches {
        // Own namespace snapshot per branch; the parent context is untouched.
        let mut branch_ctx = ctx.clone();
        branch_ctx
            .workflow_variables
            .insert(config.index_variable.clone(), json!(branch.index));
        if let Some(item) = &branch.item {
            branch_ctx
                .workflow_variables
                .insert(config.item_variable.clone(), item.clone());
        }

        let index = branch.index;
        let runner = runner.clone();
        let body = body.clone();
        let semaphore = semaphore.clone();
        let base_log_len = branch_ctx.logs.len();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("branch semaphore closed");

            let mut outputs = serde_json::Map::new();
            let mut error: Option<(String, Option<String>)> = None;
            for body_block in &body {
                let outcome = runner
                    .execute_with_error_handling(body_block, &mut branch_ctx, deadline)
                    .await;
                if outcome.success {
                    outputs = outcome.outputs;
                } else {
                    error = Some((
                        outcome.error.unwrap_or_else(|| "block failed".to_string()),
                        outcome.error_type,
                    ));
                    break;
                }
            }

            BranchResult {
                index,
                success: error.is_none(),
                outputs,
                error: error.as_ref().map(|(e, _)| e.clone()),
                error_type: error.and_then(|(_, t)| t),
                logs: branch_ctx.logs.split_off(base_log_len),
            }
        }));
    }

    // Awaiting in spawn order does not serialize anything; branches already
    // run concurrently, and completion order is unspecified anyway.
    let mut results = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => results.push(result),
            Err(err) => {
                tracing::error!("Parallel {} branch {} panicked: {}", block.id, index, err);
                results.push(BranchResult {
                    index,
                    success: false,
                    outputs: serde_json::Map::new(),
                    error: Some(format!("branch task panicked: {}", err)),
                    error_type: Some("block_execution".to_string()),
                    logs: Vec::new(),
                });
            }
        }
    }
    results.sort_by_key(|r| r.index);

    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;

    for result in &mut results {
        ctx.logs.append(&mut result.logs);
    }
    ctx.parallel_executions.insert(
        block.id.clone(),
        ParallelTracker {
            total: results.len(),
            completed: succeeded,
            failed,
        },
    );

    let aggregated = match config.aggregation {
        AggregationPolicy::Array => Value::Array(
            results
                .iter()
                .map(|r| {
                    if r.success {
                        Value::Object(r.outputs.clone())
                    } else {
                        Value::Null
                    }
                })
                .collect(),
        ),
        AggregationPolicy::Merge => {
            let mut merged = serde_json::Map::new();
            for result in results.iter().filter(|r| r.success) {
                for (key, value) in &result.outputs {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        AggregationPolicy::First => results
            .first()
            .filter(|r| r.success)
            .map(|r| Value::Object(r.outputs.clone()))
            .unwrap_or(Value::Null),
    };

    let branch_records: Vec<Value> = results
        .iter()
        .map(|r| {
            if r.success {
                json!({"index": r.index, "success": true, "outputs": Value::Object(r.outputs.clone())})
            } else {
                json!({"index": r.index, "success": false, "error": r.error, "error_type": r.error_type})
            }
        })
        .collect();

    let mut aggregate = serde_json::Map::new();
    aggregate.insert("count".to_string(), json!(results.len()));
    aggregate.insert("succeeded".to_string(), json!(succeeded));
    aggregate.insert("failed".to_string(), json!(failed));
    aggregate.insert("results".to_string(), aggregated);
    aggregate.insert("branches".to_string(), Value::Array(branch_records));

    finish(
        ctx,
        BlockOutcome::succeeded(aggregate, started.elapsed().as_millis() as u64),
    )
}
