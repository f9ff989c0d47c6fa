use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for one execution of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a block within a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What initiated an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Api,
    Webhook,
    Schedule,
    Manual,
    Chat,
}

/// A typed unit of work in a workflow graph. Owned by the workflow
/// definition; read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub block_type: String,
    /// Static configuration interpreted by the block type (or by the
    /// control-flow executors for loop/parallel blocks).
    #[serde(default)]
    pub config: Value,
    /// Input bindings; string values may contain `{{name}}` placeholders.
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Names of inputs that must be present before the block runs.
    #[serde(default)]
    pub input_schema: Vec<String>,
    /// Names of outputs the block declares it produces.
    #[serde(default)]
    pub output_schema: Vec<String>,
}

/// A directed connection between two blocks, optionally labeled for
/// conditional routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: BlockId,
    pub target: BlockId,
    #[serde(default)]
    pub source_handle: Option<String>,
}

/// A workflow definition: a set of blocks plus the edges connecting them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| &b.id == id)
    }
}

/// Lifecycle state of an execution, shared across processes.
///
/// `Completed`, `Failed`, `Cancelled` and `Timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Queued,
    Running,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// The explicit transition table. Anything not listed here is rejected.
    pub fn allowed_transitions(&self) -> &'static [ExecutionState] {
        use ExecutionState::*;
        match self {
            Pending => &[Queued, Running, Cancelled, Failed],
            Queued => &[Running, Cancelled, Failed, Timeout],
            Running => &[Paused, WaitingApproval, Completed, Failed, Cancelled, Timeout],
            Paused => &[Running, Cancelled, Failed, Timeout],
            WaitingApproval => &[Running, Cancelled, Failed, Timeout],
            Completed | Failed | Cancelled | Timeout => &[],
        }
    }

    pub fn can_transition_to(&self, to: ExecutionState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Per-block execution state within one run. Created not-executed for every
/// block at run initialization and written to its terminal value once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockState {
    pub executed: bool,
    pub success: bool,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// One entry of the ordered execution history; appended for every block
/// invocation regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLog {
    pub block_id: BlockId,
    pub block_type: String,
    pub success: bool,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The uniform per-node contract returned by the error-handling wrapper.
/// Block failures never cross the scheduler boundary as errors; they arrive
/// as an unsuccessful outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOutcome {
    pub success: bool,
    #[serde(default)]
    pub outputs: serde_json::Map<String, Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: u64,
}

impl BlockOutcome {
    pub fn succeeded(outputs: serde_json::Map<String, Value>, duration_ms: u64) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            error_type: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, error_type: &str, duration_ms: u64) -> Self {
        Self {
            success: false,
            outputs: serde_json::Map::new(),
            error: Some(error.into()),
            error_type: Some(error_type.to_string()),
            duration_ms,
        }
    }
}
