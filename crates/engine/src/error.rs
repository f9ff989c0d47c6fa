use crate::types::{BlockId, ExecutionState};
use serde::{Deserialize, Serialize};

/// Error taxonomy for the execution engine.
///
/// Validation errors are never retried; block execution errors are retried
/// only when classified recoverable. Lock acquisition failures mean "busy,
/// retry later" and are not fatal.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("block execution failed: {0}")]
    BlockExecution(String),

    #[error("workflow {workflow_id} contains a cyclic dependency")]
    CyclicDependency { workflow_id: String },

    #[error("workflow {workflow_id} has no start block")]
    MissingStartBlock { workflow_id: String },

    #[error("execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("failed to acquire lock {name} within {waited_ms}ms")]
    LockAcquisition { name: String, waited_ms: u64 },

    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(String),

    #[error("unknown block type: {0}")]
    UnknownBlockType(String),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("shared store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Stable machine-readable tag for API responses and logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::BlockExecution(_) => "block_execution",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::MissingStartBlock { .. } => "missing_start_block",
            Self::ExecutionTimeout(_) => "timeout",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::LockAcquisition { .. } => "lock_acquisition",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::UnknownBlockType(_) => "unknown_block_type",
            Self::CheckpointNotFound(_) => "checkpoint_not_found",
            Self::Store(_) => "store",
        }
    }
}

/// Message patterns that mark a failure as transient. Matched case-insensitively
/// against the error text when deciding whether a retry is worthwhile.
const RECOVERABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "service unavailable",
    "429",
    "503",
];

/// Whether an execution failure looks transient enough to retry.
pub fn is_recoverable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RECOVERABLE_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// API-safe structured error, carrying the offending block when known.
/// This is the single formatting routine: every error leaving the engine
/// passes through one of these constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_type: Option<String>,
}

impl ErrorResponse {
    pub fn from_engine_error(error: &EngineError) -> Self {
        Self {
            error: error.to_string(),
            error_type: error.error_type().to_string(),
            block_id: None,
            block_type: None,
        }
    }

    pub fn from_block_failure(
        error: impl Into<String>,
        error_type: impl Into<String>,
        block_id: &BlockId,
        block_type: &str,
    ) -> Self {
        Self {
            error: error.into(),
            error_type: error_type.into(),
            block_id: Some(block_id.0.clone()),
            block_type: Some(block_type.to_string()),
        }
    }

    pub fn with_block(mut self, block_id: &BlockId, block_type: &str) -> Self {
        self.block_id = Some(block_id.0.clone());
        self.block_type = Some(block_type.to_string());
        self
    }
}
