use crate::context::ExecutionContext;
use serde_json::Value;

pub type BlockInputs = serde_json::Map<String, Value>;
pub type BlockOutputs = serde_json::Map<String, Value>;

/// Failure modes of a block body.
///
/// Validation failures (bad or missing required inputs) are never retried;
/// execution failures may be, when the message classifies as recoverable.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("invalid block input: {0}")]
    Validation(String),

    #[error("{0}")]
    Execution(String),
}

/// The one capability every block type implements. Blocks perform their own
/// I/O; the engine never interprets their semantics.
#[async_trait::async_trait]
pub trait BlockExecutor: Send + Sync {
    /// Type tag this executor handles, for logs and error context.
    fn type_tag(&self) -> &str;

    /// Input names that must be present (and non-null) before `execute` runs.
    fn required_inputs(&self) -> &[&str] {
        &[]
    }

    /// Check the block's static configuration before the first invocation.
    fn validate_config(&self, _config: &Value) -> Result<(), BlockError> {
        Ok(())
    }

    async fn execute(
        &self,
        inputs: &BlockInputs,
        ctx: &mut ExecutionContext,
    ) -> Result<BlockOutputs, BlockError>;
}

impl std::fmt::Debug for dyn BlockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockExecutor")
            .field("type_tag", &self.type_tag())
            .finish()
    }
}
