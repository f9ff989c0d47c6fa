use crate::block::BlockOutputs;
use crate::context::ExecutionContext;
use crate::types::{Block, BlockId, Edge};
use serde::Deserialize;

/// Output key a condition block uses to name the branch it selected.
pub const PATH_OUTPUT_KEY: &str = "path";

/// Static configuration of a condition block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionConfig {
    /// Handle to follow when no edge matches the selected path.
    #[serde(default)]
    pub default_path: Option<String>,
}

/// Pick the next block after a condition block.
///
/// Scans the block's outgoing edges in declaration order for one whose
/// `source_handle` equals the output's path label; the first match wins and
/// duplicates are not deduplicated. When nothing matches and no default path
/// is configured, the branch ends silently with no next block. The chosen
/// route is recorded in the context's decision trail.
pub fn select_route(
    block: &Block,
    outputs: &BlockOutputs,
    edges: &[Edge],
    ctx: &mut ExecutionContext,
) -> Option<BlockId> {
    let config: ConditionConfig = serde_json::from_value(block.config.clone()).unwrap_or_default();

    let path = outputs.get(PATH_OUTPUT_KEY).and_then(|v| v.as_str());

    let matched = path.and_then(|label| {
        edges
            .iter()
            .find(|e| e.source_handle.as_deref() == Some(label))
    });

    let chosen = matched.or_else(|| {
        config.default_path.as_deref().and_then(|default| {
            edges
                .iter()
                .find(|e| e.source_handle.as_deref() == Some(default))
        })
    });

    let decision_key = format!("condition:{}", block.id);
    match chosen {
        Some(edge) => {
            ctx.decisions
                .insert(decision_key, edge.target.0.clone());
            tracing::debug!(
                "Condition {} routed path {:?} to {}",
                block.id,
                path,
                edge.target
            );
            Some(edge.target.clone())
        }
        None => {
            ctx.decisions.insert(decision_key, "(end)".to_string());
            tracing::debug!(
                "Condition {} matched no edge for path {:?}; branch ends",
                block.id,
                path
            );
            None
        }
    }
}
