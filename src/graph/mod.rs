//! Graph construction from the DSL.
//!
//! [`Graph::init`] turns a parsed [`GraphConfig`] into an immutable
//! adjacency structure: annotation nodes are dropped, the root is
//! discovered (preferring a `start`-typed candidate among nodes with no
//! incoming edge), each node is instantiated through the registry, and
//! when several root-class nodes exist the inactive ones plus their
//! exclusive downstream are preemptively marked Skipped.

pub mod builder;
pub mod edge;

pub use builder::Builder;
pub use edge::Edge;

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::dsl::{EdgeConfig, GraphConfig, NodeData};
use crate::nodes::{NodeBuildError, NodeRegistry, WorkflowNode};
use crate::types::{ErrorStrategy, ExecutionClass, NodeState};

/// Errors that abort graph construction.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphBuildError {
    #[error("graph must have at least one node")]
    #[diagnostic(code(flowweave::graph::empty))]
    Empty,

    #[error("duplicate node id detected: {node_id}")]
    #[diagnostic(code(flowweave::graph::duplicate_node))]
    DuplicateNodeId { node_id: String },

    #[error("unable to determine root node")]
    #[diagnostic(
        code(flowweave::graph::unknown_root),
        help("Exactly one node must have no incoming edge, preferably a start node.")
    )]
    UnknownRoot,

    #[error("root node {node_id} not found among created nodes")]
    #[diagnostic(code(flowweave::graph::missing_root))]
    MissingRoot { node_id: String },

    #[error("referenced node not found: {node_id}")]
    #[diagnostic(code(flowweave::graph::unknown_node))]
    UnknownNode { node_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Node(#[from] NodeBuildError),
}

/// Immutable adjacency structure over instantiated nodes.
pub struct Graph {
    pub nodes: FxHashMap<String, Arc<dyn WorkflowNode>>,
    pub edges: FxHashMap<String, Arc<Edge>>,
    /// node_id -> incoming edge ids
    pub in_edges: FxHashMap<String, Vec<String>>,
    /// node_id -> outgoing edge ids
    pub out_edges: FxHashMap<String, Vec<String>>,
    pub root_id: String,
}

impl Graph {
    /// Build a graph from a DSL document.
    pub fn init(config: &GraphConfig, registry: &NodeRegistry) -> Result<Graph, GraphBuildError> {
        if config.nodes.is_empty() {
            return Err(GraphBuildError::Empty);
        }

        // 1. Drop annotation nodes.
        let mut filtered = Vec::with_capacity(config.nodes.len());
        for nc in &config.nodes {
            if nc.node_type.as_deref() == Some("custom-note") {
                continue;
            }
            let envelope = NodeData::from_value(&nc.data).map_err(|source| {
                NodeBuildError::Parse {
                    node_id: nc.id.clone(),
                    source,
                }
            })?;
            if envelope.node_type == "custom-note" {
                continue;
            }
            filtered.push((nc, envelope));
        }
        if filtered.is_empty() {
            return Err(GraphBuildError::Empty);
        }

        // 2. id -> config map, rejecting duplicates.
        let mut config_map = FxHashMap::default();
        for (nc, envelope) in &filtered {
            if config_map.insert(nc.id.clone(), (*nc, envelope)).is_some() {
                return Err(GraphBuildError::DuplicateNodeId {
                    node_id: nc.id.clone(),
                });
            }
        }

        // 3. Root discovery.
        let root_id = find_root_node_id(&config_map, &config.edges)?;

        // 4. Edges and adjacency lists.
        let (edges, in_edges, out_edges) = build_edges(&config.edges);

        // 5. Node instances.
        let mut nodes: FxHashMap<String, Arc<dyn WorkflowNode>> = FxHashMap::default();
        for (nc, _) in config_map.values() {
            let node = registry.create_node(*nc)?;
            nodes.insert(nc.id.clone(), node);
        }

        // 6. Fail-branch nodes start from a clean state.
        for node in nodes.values() {
            if node.error_strategy() == ErrorStrategy::FailBranch {
                node.set_state(NodeState::Unknown);
            }
        }

        // 7. The discovered root must be one of the created nodes.
        if !nodes.contains_key(&root_id) {
            return Err(GraphBuildError::MissingRoot { node_id: root_id });
        }

        // 8. Preemptively skip inactive root branches.
        mark_inactive_root_branches(&nodes, &edges, &in_edges, &out_edges, &root_id);

        Ok(Graph {
            nodes,
            edges,
            in_edges,
            out_edges,
            root_id,
        })
    }

    #[must_use]
    pub fn root_node(&self) -> Arc<dyn WorkflowNode> {
        self.nodes[&self.root_id].clone()
    }

    #[must_use]
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<Arc<Edge>> {
        self.out_edges
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn incoming_edges(&self, node_id: &str) -> Vec<Arc<Edge>> {
        self.in_edges
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

type ConfigMap<'a> = FxHashMap<String, (&'a crate::dsl::NodeConfig, &'a NodeData)>;

fn find_root_node_id(
    config_map: &ConfigMap<'_>,
    edge_configs: &[EdgeConfig],
) -> Result<String, GraphBuildError> {
    let mut has_incoming: FxHashMap<&str, bool> = FxHashMap::default();
    for ec in edge_configs {
        if !ec.target.is_empty() {
            has_incoming.insert(ec.target.as_str(), true);
        }
    }

    let mut candidates: Vec<&String> = config_map
        .keys()
        .filter(|id| !has_incoming.contains_key(id.as_str()))
        .collect();
    candidates.sort();

    for id in &candidates {
        let (_, envelope) = &config_map[*id];
        if crate::types::NodeType::from(envelope.node_type.as_str()).is_start_node() {
            return Ok((*id).clone());
        }
    }

    candidates
        .first()
        .map(|id| (*id).clone())
        .ok_or(GraphBuildError::UnknownRoot)
}

#[allow(clippy::type_complexity)]
fn build_edges(
    edge_configs: &[EdgeConfig],
) -> (
    FxHashMap<String, Arc<Edge>>,
    FxHashMap<String, Vec<String>>,
    FxHashMap<String, Vec<String>>,
) {
    let mut edges = FxHashMap::default();
    let mut in_edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
    let mut out_edges: FxHashMap<String, Vec<String>> = FxHashMap::default();

    for (i, ec) in edge_configs.iter().enumerate() {
        if ec.source.is_empty() || ec.target.is_empty() {
            continue;
        }
        let edge_id = format!("edge_{i}");
        let handle = ec.source_handle.clone().unwrap_or_default();
        let edge = Arc::new(Edge::with_id(&edge_id, &ec.source, &ec.target, handle));
        edges.insert(edge_id.clone(), edge);
        out_edges.entry(ec.source.clone()).or_default().push(edge_id.clone());
        in_edges.entry(ec.target.clone()).or_default().push(edge_id);
    }

    (edges, in_edges, out_edges)
}

fn mark_inactive_root_branches(
    nodes: &FxHashMap<String, Arc<dyn WorkflowNode>>,
    edges: &FxHashMap<String, Arc<Edge>>,
    in_edges: &FxHashMap<String, Vec<String>>,
    out_edges: &FxHashMap<String, Vec<String>>,
    active_root_id: &str,
) {
    let top_level_roots: Vec<&String> = nodes
        .iter()
        .filter(|(_, n)| n.execution_class() == ExecutionClass::Root)
        .map(|(id, _)| id)
        .collect();

    if top_level_roots.len() <= 1 {
        return;
    }

    for root_id in top_level_roots {
        if root_id == active_root_id {
            continue;
        }
        if let Some(node) = nodes.get(root_id) {
            node.set_state(NodeState::Skipped);
            mark_downstream(root_id, nodes, edges, in_edges, out_edges);
        }
    }
}

/// A node is downstream-skipped iff every one of its incoming edges is
/// already Skipped; the marking then recurses through its out-edges.
fn mark_downstream(
    node_id: &str,
    nodes: &FxHashMap<String, Arc<dyn WorkflowNode>>,
    edges: &FxHashMap<String, Arc<Edge>>,
    in_edges: &FxHashMap<String, Vec<String>>,
    out_edges: &FxHashMap<String, Vec<String>>,
) {
    let Some(node) = nodes.get(node_id) else {
        return;
    };
    if node.state() != NodeState::Skipped {
        return;
    }

    for edge_id in out_edges.get(node_id).into_iter().flatten() {
        let Some(edge) = edges.get(edge_id) else {
            continue;
        };
        edge.set_state(NodeState::Skipped);

        let Some(target) = nodes.get(&edge.head) else {
            continue;
        };

        let all_skipped = in_edges
            .get(&edge.head)
            .into_iter()
            .flatten()
            .filter_map(|id| edges.get(id))
            .all(|e| e.state() == NodeState::Skipped);

        if all_skipped {
            target.set_state(NodeState::Skipped);
            mark_downstream(&edge.head, nodes, edges, in_edges, out_edges);
        }
    }
}
