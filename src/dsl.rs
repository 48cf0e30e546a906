//! DSL document types.
//!
//! A workflow arrives as a JSON object `{nodes: [...], edges: [...]}`.
//! Each node carries an opaque `data` payload that the matching node
//! constructor deserializes into its own config shape; the common
//! envelope fields ([`NodeData`]) are peeled off here so the factory can
//! apply error-strategy metadata uniformly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ErrorStrategy, VarMap};

/// The complete graph configuration, from the DSL or the database.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

impl GraphConfig {
    /// Parse a DSL document from JSON text.
    pub fn from_json(dsl: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(dsl)
    }
}

/// One node entry in the DSL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// One edge entry in the DSL. `sourceHandle` defaults to `"source"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, rename = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

/// Retry bounds for the `retry` error strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    /// Delay between attempts, in milliseconds.
    #[serde(default)]
    pub retry_interval: u64,
}

/// Common fields present in every node's `data` payload.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeData {
    #[serde(default, rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "desc")]
    pub description: String,
    #[serde(default)]
    pub error_strategy: Option<ErrorStrategy>,
    #[serde(default)]
    pub default_value: Option<VarMap>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl NodeData {
    /// Peel the common envelope off a raw node payload.
    pub fn from_value(data: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_document() {
        let cfg = GraphConfig::from_json(
            r#"{"nodes":[{"id":"a","data":{"type":"start","title":"Start"}}],
                "edges":[{"source":"a","target":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.nodes.len(), 1);
        assert_eq!(cfg.edges.len(), 1);
        assert!(cfg.edges[0].source_handle.is_none());
    }

    #[test]
    fn node_data_envelope_with_strategy() {
        let data = json!({
            "type": "func",
            "title": "Fetch",
            "error_strategy": "retry",
            "retry": {"max_retries": 3, "retry_interval": 250}
        });
        let nd = NodeData::from_value(&data).unwrap();
        assert_eq!(nd.node_type, "func");
        assert_eq!(nd.error_strategy, Some(ErrorStrategy::Retry));
        assert_eq!(nd.retry.unwrap().max_retries, 3);
    }

    #[test]
    fn node_data_defaults_are_empty() {
        let nd = NodeData::from_value(&json!({"type": "start", "title": "s"})).unwrap();
        assert!(nd.error_strategy.is_none());
        assert!(nd.default_value.is_none());
        assert!(nd.retry.is_none());
    }
}
