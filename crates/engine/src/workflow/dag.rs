use crate::error::EngineError;
use crate::types::{BlockId, Edge, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// DAG representation of a workflow's blocks and edges
#[derive(Debug)]
pub struct WorkflowDag {
    workflow_id: String,
    graph: DiGraph<BlockId, ()>,
    block_indices: HashMap<BlockId, NodeIndex>,
    declaration_order: Vec<BlockId>,
    /// Outgoing edges per block, in edge declaration order. Routing relies on
    /// this order ("first match wins"), which petgraph's adjacency iteration
    /// does not preserve.
    outgoing: HashMap<BlockId, Vec<Edge>>,
}

impl WorkflowDag {
    /// Build a DAG from a workflow definition. Every edge endpoint must
    /// reference an existing block.
    pub fn from_definition(workflow: &WorkflowDefinition) -> Result<Self, EngineError> {
        let mut graph = DiGraph::new();
        let mut block_indices = HashMap::new();
        let mut declaration_order = Vec::new();

        for block in &workflow.blocks {
            let node = graph.add_node(block.id.clone());
            block_indices.insert(block.id.clone(), node);
            declaration_order.push(block.id.clone());
        }

        let mut outgoing: HashMap<BlockId, Vec<Edge>> = HashMap::new();
        for edge in &workflow.edges {
            let source = block_indices.get(&edge.source).ok_or_else(|| {
                EngineError::Validation(format!(
                    "edge references unknown source block {}",
                    edge.source
                ))
            })?;
            let target = block_indices.get(&edge.target).ok_or_else(|| {
                EngineError::Validation(format!(
                    "edge references unknown target block {}",
                    edge.target
                ))
            })?;
            graph.add_edge(*source, *target, ());
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
        }

        Ok(Self {
            workflow_id: workflow.id.0.clone(),
            graph,
            block_indices,
            declaration_order,
            outgoing,
        })
    }

    /// Blocks in topological order via Kahn's algorithm.
    ///
    /// Zero-in-degree blocks are seeded (and ties broken) in declaration
    /// order, so the result is deterministic for a given definition. A short
    /// order means the graph contains a cycle; scheduling fails and zero
    /// blocks execute.
    pub fn topological_order(&self) -> Result<Vec<BlockId>, EngineError> {
        let node_count = self.graph.node_count();
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(node_count);
        for node in self.graph.node_indices() {
            in_degree.insert(
                node,
                self.graph
                    .edges_directed(node, petgraph::Direction::Incoming)
                    .count(),
            );
        }

        let positions: HashMap<&BlockId, usize> = self
            .declaration_order
            .iter()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect();

        // Min-heap on declaration position keeps the dequeue order stable.
        let mut ready: BinaryHeap<Reverse<usize>> = BinaryHeap::new();
        for (position, block_id) in self.declaration_order.iter().enumerate() {
            let node = self.block_indices[block_id];
            if in_degree[&node] == 0 {
                ready.push(Reverse(position));
            }
        }

        let mut order = Vec::with_capacity(node_count);
        while let Some(Reverse(position)) = ready.pop() {
            let block_id = &self.declaration_order[position];
            order.push(block_id.clone());

            let node = self.block_indices[block_id];
            for edge in self.graph.edges_directed(node, petgraph::Direction::Outgoing) {
                let target = petgraph::visit::EdgeRef::target(&edge);
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(&target_position) = positions.get(&self.graph[target]) {
                            ready.push(Reverse(target_position));
                        }
                    }
                }
            }
        }

        if order.len() < node_count {
            return Err(EngineError::CyclicDependency {
                workflow_id: self.workflow_id.clone(),
            });
        }

        Ok(order)
    }

    /// Blocks with no incoming edge, in declaration order.
    pub fn start_blocks(&self) -> Vec<BlockId> {
        self.declaration_order
            .iter()
            .filter(|block_id| {
                let node = self.block_indices[*block_id];
                self.graph
                    .edges_directed(node, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .cloned()
            .collect()
    }

    /// Outgoing edges of a block, in edge declaration order.
    pub fn outgoing_edges(&self, block_id: &BlockId) -> &[Edge] {
        self.outgoing
            .get(block_id)
            .map(|edges| edges.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, WorkflowId};
    use serde_json::Value;

    fn block(id: &str) -> Block {
        Block {
            id: BlockId::new(id),
            block_type: "echo".to_string(),
            config: Value::Null,
            inputs: serde_json::Map::new(),
            input_schema: vec![],
            output_schema: vec![],
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: BlockId::new(source),
            target: BlockId::new(target),
            source_handle: None,
        }
    }

    fn workflow(blocks: Vec<Block>, edges: Vec<Edge>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::new("wf"),
            name: "test".to_string(),
            blocks,
            edges,
        }
    }

    #[test]
    fn order_is_a_permutation_respecting_edges() {
        let wf = workflow(
            vec![block("a"), block("b"), block("c"), block("d")],
            vec![edge("a", "c"), edge("b", "c"), edge("c", "d")],
        );
        let dag = WorkflowDag::from_definition(&wf).unwrap();
        let order = dag.topological_order().unwrap();

        assert_eq!(order.len(), 4);
        let position = |id: &str| order.iter().position(|b| b.0 == id).unwrap();
        for e in &wf.edges {
            assert!(
                position(&e.source.0) < position(&e.target.0),
                "{} must precede {}",
                e.source,
                e.target
            );
        }
    }

    #[test]
    fn ties_break_by_declaration_order() {
        let wf = workflow(
            vec![block("z"), block("m"), block("a")],
            vec![], // all independent
        );
        let dag = WorkflowDag::from_definition(&wf).unwrap();
        let order = dag.topological_order().unwrap();
        let ids: Vec<&str> = order.iter().map(|b| b.0.as_str()).collect();
        assert_eq!(ids, vec!["z", "m", "a"]);
    }

    #[test]
    fn cycle_is_rejected_with_workflow_name() {
        let wf = workflow(
            vec![block("a"), block("b")],
            vec![edge("a", "b"), edge("b", "a")],
        );
        let dag = WorkflowDag::from_definition(&wf).unwrap();
        let err = dag.topological_order().unwrap_err();
        match err {
            EngineError::CyclicDependency { workflow_id } => assert_eq!(workflow_id, "wf"),
            other => panic!("expected cyclic dependency error, got {:?}", other),
        }
    }

    #[test]
    fn start_blocks_have_no_incoming_edges() {
        let wf = workflow(
            vec![block("a"), block("b"), block("c")],
            vec![edge("a", "c"), edge("b", "c")],
        );
        let dag = WorkflowDag::from_definition(&wf).unwrap();
        let start_blocks = dag.start_blocks();
        let starts: Vec<&str> = start_blocks.iter().map(|b| b.0.as_str()).collect();
        assert_eq!(starts, vec!["a", "b"]);
    }

    #[test]
    fn dangling_edge_endpoint_is_a_validation_error() {
        let wf = workflow(vec![block("a")], vec![edge("a", "ghost")]);
        let err = WorkflowDag::from_definition(&wf).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn outgoing_edges_preserve_declaration_order() {
        let wf = workflow(
            vec![block("cond"), block("x"), block("y")],
            vec![
                Edge {
                    source: BlockId::new("cond"),
                    target: BlockId::new("x"),
                    source_handle: Some("true".to_string()),
                },
                Edge {
                    source: BlockId::new("cond"),
                    target: BlockId::new("y"),
                    source_handle: Some("true".to_string()),
                },
            ],
        );
        let dag = WorkflowDag::from_definition(&wf).unwrap();
        let edges = dag.outgoing_edges(&BlockId::new("cond"));
        assert_eq!(edges[0].target.0, "x");
        assert_eq!(edges[1].target.0, "y");
    }
}
