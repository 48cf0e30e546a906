//! The two event layers of a graph run.
//!
//! [`NodeEvent`]s are produced inside a node's execution channel and
//! consumed by the engine; the dispatcher projects them onto the external
//! [`GraphEvent`] stream that HTTP/SSE consumers drain. The stream is
//! finite and not restartable: `graph_run_started` is always first, and
//! exactly one terminal event (`graph_run_succeeded` / `graph_run_failed`
//! / `graph_run_aborted`) is always last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recorder::NodeExecution;
use crate::types::{NodeExecutionStatus, NodeType, VarMap};

/// Discriminant shared by both event layers, serialized with the exact
/// wire names of the external contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GraphRunStarted,
    GraphRunSucceeded,
    GraphRunFailed,
    GraphRunAborted,
    NodeRunStarted,
    NodeRunSucceeded,
    NodeRunFailed,
    NodeStreamChunk,
}

/// Internal event emitted on a node's execution channel.
///
/// A well-behaved node emits `started` once, then zero or more
/// `stream_chunk`s, then exactly one of `succeeded` | `failed`, and
/// closes the channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Execution id, unique per node attempt.
    pub id: String,
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<VarMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VarMap>,
}

impl NodeEvent {
    #[must_use]
    pub fn run_started(
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: NodeType,
        title: impl Into<String>,
    ) -> Self {
        NodeEvent {
            kind: EventKind::NodeRunStarted,
            id: execution_id.into(),
            node_id: node_id.into(),
            node_type,
            node_title: title.into(),
            start_at: Some(Utc::now()),
            outputs: None,
            error: None,
            status: None,
            chunk: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn run_succeeded(
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: NodeType,
        outputs: VarMap,
    ) -> Self {
        NodeEvent {
            kind: EventKind::NodeRunSucceeded,
            id: execution_id.into(),
            node_id: node_id.into(),
            node_type,
            node_title: String::new(),
            start_at: None,
            outputs: Some(outputs),
            error: None,
            status: Some(NodeExecutionStatus::Succeeded),
            chunk: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn run_failed(
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: NodeType,
        error: impl Into<String>,
    ) -> Self {
        NodeEvent {
            kind: EventKind::NodeRunFailed,
            id: execution_id.into(),
            node_id: node_id.into(),
            node_type,
            node_title: String::new(),
            start_at: None,
            outputs: None,
            error: Some(error.into()),
            status: Some(NodeExecutionStatus::Failed),
            chunk: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn stream_chunk(
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: NodeType,
        chunk: impl Into<String>,
    ) -> Self {
        NodeEvent {
            kind: EventKind::NodeStreamChunk,
            id: execution_id.into(),
            node_id: node_id.into(),
            node_type,
            node_title: String::new(),
            start_at: None,
            outputs: None,
            error: None,
            status: None,
            chunk: Some(chunk.into()),
            metadata: None,
        }
    }

    /// Attach metadata to a terminal event (builder style).
    #[must_use]
    pub fn with_metadata(mut self, metadata: VarMap) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Externally observable event of a graph run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<VarMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceptions_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_executions: Option<Vec<NodeExecution>>,
}

impl GraphEvent {
    #[must_use]
    pub fn run_started() -> Self {
        GraphEvent::bare(EventKind::GraphRunStarted)
    }

    #[must_use]
    pub fn run_succeeded(outputs: VarMap, node_executions: Vec<NodeExecution>) -> Self {
        GraphEvent {
            outputs: Some(outputs),
            node_executions: Some(node_executions),
            ..GraphEvent::bare(EventKind::GraphRunSucceeded)
        }
    }

    #[must_use]
    pub fn run_failed(
        error: impl Into<String>,
        exceptions_count: u32,
        node_executions: Vec<NodeExecution>,
    ) -> Self {
        GraphEvent {
            error: Some(error.into()),
            exceptions_count: Some(exceptions_count),
            node_executions: Some(node_executions),
            ..GraphEvent::bare(EventKind::GraphRunFailed)
        }
    }

    #[must_use]
    pub fn run_aborted(reason: impl Into<String>, node_executions: Vec<NodeExecution>) -> Self {
        GraphEvent {
            error: Some(reason.into()),
            node_executions: Some(node_executions),
            ..GraphEvent::bare(EventKind::GraphRunAborted)
        }
    }

    /// True for the three terminal kinds.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::GraphRunSucceeded | EventKind::GraphRunFailed | EventKind::GraphRunAborted
        )
    }

    fn bare(kind: EventKind) -> Self {
        GraphEvent {
            kind,
            node_id: None,
            chunk: None,
            outputs: None,
            error: None,
            exceptions_count: None,
            node_executions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::new_var_map;

    #[test]
    fn event_kinds_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::GraphRunStarted).unwrap(),
            "\"graph_run_started\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::NodeStreamChunk).unwrap(),
            "\"node_stream_chunk\""
        );
    }

    #[test]
    fn node_event_sequence_shapes() {
        let started = NodeEvent::run_started("x", "n1", NodeType::Llm, "LLM");
        assert!(started.start_at.is_some());

        let mut outputs = new_var_map();
        outputs.insert("text".into(), serde_json::json!("hi"));
        let ok = NodeEvent::run_succeeded("x", "n1", NodeType::Llm, outputs);
        assert_eq!(ok.status, Some(NodeExecutionStatus::Succeeded));

        let failed = NodeEvent::run_failed("x", "n1", NodeType::Llm, "boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn terminal_detection() {
        assert!(!GraphEvent::run_started().is_terminal());
        assert!(GraphEvent::run_succeeded(new_var_map(), vec![]).is_terminal());
        assert!(GraphEvent::run_failed("e", 1, vec![]).is_terminal());
        assert!(GraphEvent::run_aborted("a", vec![]).is_terminal());
    }
}
