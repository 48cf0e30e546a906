//! Node type registry and factory.
//!
//! The registry maps a DSL type tag to a constructor; the factory peels
//! the common [`NodeData`] envelope off a node's payload, resolves the
//! constructor, and hands both to it. Unlike a process-global table, the
//! registry is an owned value so embedders can extend or replace the
//! built-in set per runner.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::dsl::{NodeConfig, NodeData};
use crate::nodes::{NodeBuildError, WorkflowNode};
use crate::types::NodeType;

/// Constructor signature: `(node_id, raw_data, parsed_envelope)`.
pub type NodeConstructor = Arc<
    dyn Fn(&str, &Value, &NodeData) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> + Send + Sync,
>;

/// Maps node-type tags to constructors.
pub struct NodeRegistry {
    constructors: FxHashMap<NodeType, NodeConstructor>,
}

impl NodeRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        NodeRegistry {
            constructors: FxHashMap::default(),
        }
    }

    /// A registry with every built-in node type registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = NodeRegistry::new();
        registry.register(NodeType::Start, Arc::new(super::start::build));
        registry.register(NodeType::End, Arc::new(super::end::build));
        registry.register(NodeType::Answer, Arc::new(super::answer::build));
        registry.register(NodeType::IfElse, Arc::new(super::if_else::build));
        registry.register(
            NodeType::TemplateTransform,
            Arc::new(super::template::build),
        );
        registry.register(NodeType::HttpRequest, Arc::new(super::http_request::build));
        registry.register(NodeType::Function, Arc::new(super::function::build));
        registry.register(NodeType::Llm, Arc::new(super::llm::build));
        registry.register(NodeType::Iteration, Arc::new(super::iteration::build));
        registry.register(
            NodeType::IterationStart,
            Arc::new(super::iteration::build_start),
        );
        registry
    }

    /// Register (or replace) a constructor for a type tag.
    pub fn register(&mut self, node_type: NodeType, constructor: NodeConstructor) {
        self.constructors.insert(node_type, constructor);
    }

    #[must_use]
    pub fn has(&self, node_type: &NodeType) -> bool {
        self.constructors.contains_key(node_type)
    }

    /// Registered type tags, for diagnostics.
    #[must_use]
    pub fn registered_types(&self) -> Vec<NodeType> {
        self.constructors.keys().cloned().collect()
    }

    /// Create a node instance from its DSL entry.
    pub fn create_node(&self, config: &NodeConfig) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
        let data = NodeData::from_value(&config.data).map_err(|source| NodeBuildError::Parse {
            node_id: config.id.clone(),
            source,
        })?;
        let node_type = NodeType::from(data.node_type.as_str());

        let constructor =
            self.constructors
                .get(&node_type)
                .ok_or_else(|| NodeBuildError::UnknownType {
                    node_id: config.id.clone(),
                    node_type: data.node_type.clone(),
                })?;

        constructor(&config.id, &config.data, &data)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        NodeRegistry::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_config(id: &str, data: Value) -> NodeConfig {
        NodeConfig {
            id: id.to_string(),
            node_type: None,
            data,
        }
    }

    #[test]
    fn builtins_cover_the_dsl_node_set() {
        let registry = NodeRegistry::with_builtins();
        for tag in [
            "start",
            "end",
            "answer",
            "if-else",
            "template-transform",
            "http-request",
            "func",
            "llm",
            "iteration",
        ] {
            assert!(registry.has(&NodeType::from(tag)), "missing {tag}");
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = NodeRegistry::with_builtins();
        let result = registry.create_node(&node_config(
            "x",
            json!({"type": "quantum-leap", "title": "?"}),
        ));
        let err = match result {
            Ok(_) => panic!("expected create_node to fail for unknown type"),
            Err(e) => e,
        };
        assert!(matches!(err, NodeBuildError::UnknownType { .. }));
    }

    #[test]
    fn factory_applies_error_strategy_envelope() {
        let registry = NodeRegistry::with_builtins();
        let node = registry
            .create_node(&node_config(
                "s",
                json!({
                    "type": "start",
                    "title": "Start",
                    "error_strategy": "retry",
                    "retry": {"max_retries": 2, "retry_interval": 10},
                    "variables": []
                }),
            ))
            .unwrap();
        assert_eq!(node.error_strategy(), crate::types::ErrorStrategy::Retry);
        assert_eq!(node.retry_policy().unwrap().max_retries, 2);
    }
}
