//! Programmatic graph builder.
//!
//! A fluent alternative to the DSL path, mainly for embedders and tests:
//! register a root, chain nodes off predecessors, and connect existing
//! nodes with tagged edges.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{Edge, Graph, GraphBuildError};
use crate::nodes::WorkflowNode;
use crate::types::SOURCE_HANDLE_DEFAULT;

/// Fluent builder over instantiated nodes.
#[derive(Default)]
pub struct Builder {
    nodes: Vec<Arc<dyn WorkflowNode>>,
    node_ids: FxHashMap<String, usize>,
    edges: Vec<Edge>,
    edge_count: usize,
    error: Option<GraphBuildError>,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Builder::default()
    }

    /// Register the root node. Must be called exactly once, first.
    #[must_use]
    pub fn add_root(mut self, node: Arc<dyn WorkflowNode>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !self.nodes.is_empty() {
            self.error = Some(GraphBuildError::DuplicateNodeId {
                node_id: node.id().to_string(),
            });
            return self;
        }
        self.register(node);
        self
    }

    /// Add a node connected from `from_node_id` (or from the most
    /// recently added node when empty) over `source_handle`.
    #[must_use]
    pub fn add_node(
        mut self,
        node: Arc<dyn WorkflowNode>,
        from_node_id: &str,
        source_handle: &str,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let predecessor = if from_node_id.is_empty() {
            match self.nodes.last() {
                Some(last) => last.id().to_string(),
                None => {
                    self.error = Some(GraphBuildError::UnknownRoot);
                    return self;
                }
            }
        } else {
            from_node_id.to_string()
        };

        if !self.node_ids.contains_key(&predecessor) {
            self.error = Some(GraphBuildError::UnknownNode {
                node_id: predecessor,
            });
            return self;
        }

        let head = node.id().to_string();
        self.register(node);
        if self.error.is_some() {
            return self;
        }
        self.push_edge(&predecessor, &head, source_handle);
        self
    }

    /// Connect two already-registered nodes.
    #[must_use]
    pub fn connect(mut self, tail: &str, head: &str, source_handle: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        for id in [tail, head] {
            if !self.node_ids.contains_key(id) {
                self.error = Some(GraphBuildError::UnknownNode {
                    node_id: id.to_string(),
                });
                return self;
            }
        }
        self.push_edge(tail, head, source_handle);
        self
    }

    /// Finish construction.
    pub fn build(self) -> Result<Graph, GraphBuildError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.nodes.is_empty() {
            return Err(GraphBuildError::Empty);
        }

        let root_id = self.nodes[0].id().to_string();

        let mut nodes = FxHashMap::default();
        for node in self.nodes {
            nodes.insert(node.id().to_string(), node);
        }

        let mut edges = FxHashMap::default();
        let mut in_edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut out_edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for edge in self.edges {
            out_edges
                .entry(edge.tail.clone())
                .or_default()
                .push(edge.id.clone());
            in_edges
                .entry(edge.head.clone())
                .or_default()
                .push(edge.id.clone());
            edges.insert(edge.id.clone(), Arc::new(edge));
        }

        Ok(Graph {
            nodes,
            edges,
            in_edges,
            out_edges,
            root_id,
        })
    }

    fn register(&mut self, node: Arc<dyn WorkflowNode>) {
        let id = node.id().to_string();
        if id.is_empty() || self.node_ids.contains_key(&id) {
            self.error = Some(GraphBuildError::DuplicateNodeId { node_id: id });
            return;
        }
        self.node_ids.insert(id, self.nodes.len());
        self.nodes.push(node);
    }

    fn push_edge(&mut self, tail: &str, head: &str, source_handle: &str) {
        let handle = if source_handle.is_empty() {
            SOURCE_HANDLE_DEFAULT
        } else {
            source_handle
        };
        let edge_id = format!("edge_{}", self.edge_count);
        self.edge_count += 1;
        self.edges.push(Edge::with_id(edge_id, tail, head, handle));
    }
}
