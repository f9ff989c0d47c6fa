use crate::types::{
    Block, BlockId, BlockLog, BlockOutcome, BlockState, ExecutionId, ExecutionState, TriggerKind,
    WorkflowDefinition, WorkflowId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Progress counters for one parallel block within a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelTracker {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Mutable per-run state container. Exclusively owned by one execution;
/// created at run start and discarded (or serialized) at run end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub user_id: String,
    pub trigger: TriggerKind,
    /// Per-block state, seeded not-executed for every block of the workflow.
    pub block_states: HashMap<BlockId, BlockState>,
    /// Ordered history of block invocations.
    pub logs: Vec<BlockLog>,
    /// Workflow variable namespace. Mutated in place; loop iterations and
    /// parallel branches must restore it on every exit path.
    pub workflow_variables: serde_json::Map<String, Value>,
    /// Environment variable namespace, resolved after workflow variables.
    pub environment_variables: HashMap<String, String>,
    /// Completed iteration counts per loop block.
    pub loop_iterations: HashMap<BlockId, usize>,
    /// Branch progress per parallel block.
    pub parallel_executions: HashMap<BlockId, ParallelTracker>,
    /// Routing/debug trail, e.g. which edge a condition block selected.
    pub decisions: HashMap<String, String>,
    pub status: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_used: u64,
    pub cost_cents: u64,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow: &WorkflowDefinition,
        user_id: impl Into<String>,
        trigger: TriggerKind,
        input_data: Value,
        environment_variables: HashMap<String, String>,
    ) -> Self {
        let block_states = workflow
            .blocks
            .iter()
            .map(|b| (b.id.clone(), BlockState::default()))
            .collect();

        let mut workflow_variables = serde_json::Map::new();
        workflow_variables.insert("input".to_string(), input_data);

        Self {
            execution_id,
            workflow_id: workflow.id.clone(),
            user_id: user_id.into(),
            trigger,
            block_states,
            logs: Vec::new(),
            workflow_variables,
            environment_variables,
            loop_iterations: HashMap::new(),
            parallel_executions: HashMap::new(),
            decisions: HashMap::new(),
            status: ExecutionState::Running,
            started_at: Utc::now(),
            completed_at: None,
            tokens_used: 0,
            cost_cents: 0,
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.workflow_variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.workflow_variables.get(name)
    }

    /// Accumulate token/cost usage reported by a block.
    pub fn add_usage(&mut self, tokens: u64, cost_cents: u64) {
        self.tokens_used += tokens;
        self.cost_cents += cost_cents;
    }

    /// Record a finished invocation: append one log entry, and write the
    /// block's terminal state if it has not been written yet. A block that
    /// runs more than once (loop/parallel bodies) keeps its first terminal
    /// state; the state never regresses. Every invocation is still logged.
    pub fn apply_outcome(
        &mut self,
        block: &Block,
        outcome: &BlockOutcome,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) {
        let state = self.block_states.entry(block.id.clone()).or_default();
        if !state.executed {
            state.executed = true;
            state.success = outcome.success;
            state.outputs = if outcome.success {
                Some(Value::Object(outcome.outputs.clone()))
            } else {
                None
            };
            state.error = outcome.error.clone();
            state.started_at = Some(started_at);
            state.ended_at = Some(ended_at);
            state.duration_ms = Some(outcome.duration_ms);
        }

        self.logs.push(BlockLog {
            block_id: block.id.clone(),
            block_type: block.block_type.clone(),
            success: outcome.success,
            outputs: if outcome.success {
                Some(Value::Object(outcome.outputs.clone()))
            } else {
                None
            },
            error: outcome.error.clone(),
            error_type: outcome.error_type.clone(),
            started_at,
            ended_at,
            duration_ms: outcome.duration_ms,
        });
    }

    /// Last log entry that failed, if any. Used to attach block context to
    /// the structured error returned from the run.
    pub fn last_failure(&self) -> Option<&BlockLog> {
        self.logs.iter().rev().find(|l| !l.success)
    }
}

/// Scoped overlay of iteration/branch variables onto the workflow namespace.
///
/// `apply` records the displaced values; `restore` must be called on every
/// exit path, including failure, so variables never leak across iterations
/// or into sibling scopes.
#[derive(Debug)]
pub struct VariableOverlay {
    displaced: Vec<(String, Option<Value>)>,
}

impl VariableOverlay {
    pub fn apply(
        ctx: &mut ExecutionContext,
        vars: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        let mut displaced = Vec::new();
        for (name, value) in vars {
            let previous = ctx.workflow_variables.insert(name.clone(), value);
            displaced.push((name, previous));
        }
        Self { displaced }
    }

    pub fn restore(self, ctx: &mut ExecutionContext) {
        // Restore in reverse so nested overlays of the same name unwind correctly.
        for (name, previous) in self.displaced.into_iter().rev() {
            match previous {
                Some(value) => {
                    ctx.workflow_variables.insert(name, value);
                }
                None => {
                    ctx.workflow_variables.remove(&name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::new("wf"),
            name: "test".to_string(),
            blocks: vec![Block {
                id: BlockId::new("a"),
                block_type: "echo".to_string(),
                config: Value::Null,
                inputs: serde_json::Map::new(),
                input_schema: vec![],
                output_schema: vec![],
            }],
            edges: vec![],
        }
    }

    fn test_context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionId::new(),
            &test_workflow(),
            "user",
            TriggerKind::Api,
            json!({"k": 1}),
            HashMap::new(),
        )
    }

    #[test]
    fn seeds_block_states_not_executed() {
        let ctx = test_context();
        let state = ctx.block_states.get(&BlockId::new("a")).unwrap();
        assert!(!state.executed);
        assert!(ctx.get_variable("input").is_some());
    }

    #[test]
    fn block_state_is_written_once_and_never_regresses() {
        let mut ctx = test_context();
        let block = test_workflow().blocks[0].clone();

        let ok = BlockOutcome::succeeded(serde_json::Map::new(), 5);
        let bad = BlockOutcome::failed("boom", "block_execution", 7);
        let now = Utc::now();

        ctx.apply_outcome(&block, &ok, now, now);
        ctx.apply_outcome(&block, &bad, now, now);

        let state = ctx.block_states.get(&block.id).unwrap();
        assert!(state.executed);
        assert!(state.success, "terminal state regressed");
        // both invocations are logged
        assert_eq!(ctx.logs.len(), 2);
        assert!(!ctx.logs[1].success);
    }

    #[test]
    fn overlay_restores_displaced_and_fresh_variables() {
        let mut ctx = test_context();
        ctx.set_variable("x", json!("outer"));
        let before = ctx.workflow_variables.clone();

        let overlay = VariableOverlay::apply(
            &mut ctx,
            vec![
                ("x".to_string(), json!("inner")),
                ("index".to_string(), json!(0)),
            ],
        );
        assert_eq!(ctx.get_variable("x"), Some(&json!("inner")));
        assert_eq!(ctx.get_variable("index"), Some(&json!(0)));

        overlay.restore(&mut ctx);
        assert_eq!(ctx.workflow_variables, before);
    }

    #[test]
    fn usage_counters_accumulate() {
        let mut ctx = test_context();
        ctx.add_usage(100, 3);
        ctx.add_usage(50, 2);
        assert_eq!(ctx.tokens_used, 150);
        assert_eq!(ctx.cost_cents, 5);
    }
}
