use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::state::StateManager;
use crate::types::{BlockId, ExecutionState, WorkflowDefinition};
use crate::workflow::dag::WorkflowDag;
use crate::workflow::runner::{
    BlockRunner, ERROR_TYPE_TIMEOUT, ERROR_TYPE_VALIDATION,
};
use crate::workflow::{condition, loops, parallel};
use crate::workflow::{CONDITION_BLOCK_TYPE, LOOP_BLOCK_TYPE, PARALLEL_BLOCK_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a run ended when no error was raised
#[derive(Debug)]
pub enum RunOutcome {
    Completed { output: Option<Value> },
    /// Cancellation observed at a scheduler step; the remaining blocks did
    /// not run.
    Cancelled,
}

/// A failed run with the offending block attached when known
#[derive(Debug)]
pub struct RunError {
    pub error: EngineError,
    pub block_id: Option<BlockId>,
    pub block_type: Option<String>,
}

impl RunError {
    fn engine(error: EngineError) -> Self {
        Self {
            error,
            block_id: None,
            block_type: None,
        }
    }
}

enum Control {
    Continue,
    Cancelled,
}

/// Walks one workflow's topological order, delegating every node to the
/// block runner and routing around condition/loop/parallel blocks.
///
/// Cancellation and pausing are cooperative: the distributed state is
/// checked between nodes, never mid-block. An in-flight block call finishes
/// before a cancel takes effect.
pub struct WorkflowExecutor {
    runner: BlockRunner,
    state: Arc<StateManager>,
}

impl WorkflowExecutor {
    pub fn new(runner: BlockRunner, state: Arc<StateManager>) -> Self {
        Self { runner, state }
    }

    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
    ) -> Result<RunOutcome, RunError> {
        let dag = WorkflowDag::from_definition(workflow).map_err(RunError::engine)?;

        let start_blocks = dag.start_blocks();
        if start_blocks.is_empty() {
            return Err(RunError::engine(EngineError::MissingStartBlock {
                workflow_id: workflow.id.0.clone(),
            }));
        }

        // A cycle fails the run here, before any block executes.
        let order = dag.topological_order().map_err(RunError::engine)?;

        let body_owned = collect_body_blocks(workflow);
        let mut active: HashSet<BlockId> = start_blocks
            .into_iter()
            .filter(|id| !body_owned.contains(id))
            .collect();

        let budget = self.runner.config().workflow_timeout();
        let deadline = Instant::now() + budget;
        let mut last_output: Option<Value> = None;

        for block_id in &order {
            if body_owned.contains(block_id) {
                // Loop/parallel bodies run under their owning block.
                continue;
            }

            match self.observe_control(ctx, deadline).await? {
                Control::Cancelled => {
                    tracing::warn!("Execution {} cancelled; stopping walk", ctx.execution_id);
                    return Ok(RunOutcome::Cancelled);
                }
                Control::Continue => {}
            }

            if Instant::now() >= deadline {
                return Err(RunError::engine(EngineError::ExecutionTimeout(format!(
                    "workflow budget of {}s exceeded",
                    budget.as_secs()
                ))));
            }

            if !active.contains(block_id) {
                tracing::trace!("Block {} not on an active path; skipped", block_id);
                continue;
            }

            let Some(block) = workflow.block(block_id) else {
                return Err(RunError::engine(EngineError::Validation(format!(
                    "scheduled block {} missing from definition",
                    block_id
                ))));
            };

            tracing::info!("Executing block {} ({})", block.id, block.block_type);
            let outcome = match block.block_type.as_str() {
                LOOP_BLOCK_TYPE => {
                    loops::run_loop(&self.runner, workflow, block, ctx, deadline).await
                }
                PARALLEL_BLOCK_TYPE => {
                    parallel::run_parallel(&self.runner, workflow, block, ctx, deadline).await
                }
                _ => {
                    self.runner
                        .execute_with_error_handling(block, ctx, deadline)
                        .await
                }
            };

            let status = if outcome.success { "success" } else { "failure" };
            let result_snapshot = if outcome.success {
                Value::Object(outcome.outputs.clone())
            } else {
                json!({"error": outcome.error})
            };
            if let Err(err) = self
                .state
                .record_node_result(&ctx.execution_id, block_id, result_snapshot, status)
                .await
            {
                tracing::warn!("Failed to record node result for {}: {}", block_id, err);
            }

            if !outcome.success {
                // Fail-fast: a block failure halts the remaining run.
                let message = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "block failed".to_string());
                let error = match outcome.error_type.as_deref() {
                    Some(ERROR_TYPE_VALIDATION) => EngineError::Validation(message),
                    Some(ERROR_TYPE_TIMEOUT) => EngineError::ExecutionTimeout(message),
                    _ => EngineError::BlockExecution(message),
                };
                return Err(RunError {
                    error,
                    block_id: Some(block.id.clone()),
                    block_type: Some(block.block_type.clone()),
                });
            }

            if block.block_type == CONDITION_BLOCK_TYPE {
                let next =
                    condition::select_route(block, &outcome.outputs, dag.outgoing_edges(block_id), ctx);
                if let Some(next) = next {
                    if !body_owned.contains(&next) {
                        active.insert(next);
                    }
                }
            } else {
                for edge in dag.outgoing_edges(block_id) {
                    if !body_owned.contains(&edge.target) {
                        active.insert(edge.target.clone());
                    }
                }
            }

            last_output = Some(Value::Object(outcome.outputs));
        }

        Ok(RunOutcome::Completed {
            output: last_output,
        })
    }

    /// Observe pause/cancel requests between nodes. A paused run suspends
    /// here until it is resumed or cancelled, still bounded by the run
    /// deadline.
    async fn observe_control(
        &self,
        ctx: &ExecutionContext,
        deadline: Instant,
    ) -> Result<Control, RunError> {
        loop {
            let state = self
                .state
                .current_state(&ctx.execution_id)
                .await
                .map_err(RunError::engine)?;

            match state {
                Some(ExecutionState::Cancelled) => return Ok(Control::Cancelled),
                Some(ExecutionState::Paused) | Some(ExecutionState::WaitingApproval) => {
                    if Instant::now() >= deadline {
                        return Err(RunError::engine(EngineError::ExecutionTimeout(
                            "workflow budget exceeded while paused".to_string(),
                        )));
                    }
                    tokio::time::sleep(CONTROL_POLL_INTERVAL).await;
                }
                _ => return Ok(Control::Continue),
            }
        }
    }
}

/// Body blocks owned by loop/parallel blocks; excluded from the main walk.
fn collect_body_blocks(workflow: &WorkflowDefinition) -> HashSet<BlockId> {
    #[derive(Deserialize)]
    struct BodyOnly {
        #[serde(default)]
        body: Vec<BlockId>,
    }

    let mut owned = HashSet::new();
    for block in &workflow.blocks {
        if block.block_type == LOOP_BLOCK_TYPE || block.block_type == PARALLEL_BLOCK_TYPE {
            if let Ok(config) = serde_json::from_value::<BodyOnly>(block.config.clone()) {
                owned.extend(config.body);
            }
        }
    }
    owned
}
