//! Graph edges.
//!
//! Edges carry no payload — dataflow is indirect through the variable
//! pool. The mutable state cell mirrors node state so branching and skip
//! propagation can mark edges concurrently with worker execution.

use std::sync::atomic::{AtomicU8, Ordering};

use uuid::Uuid;

use crate::types::{NodeState, SOURCE_HANDLE_DEFAULT};

/// A directed connection between two nodes.
#[derive(Debug)]
pub struct Edge {
    pub id: String,
    /// Source node id.
    pub tail: String,
    /// Target node id.
    pub head: String,
    /// Branching tag: `"source"` for default flow, `"fail-branch"` /
    /// `"success-branch"` for error-strategy routing, or an arbitrary
    /// condition id for conditional branches.
    pub source_handle: String,
    state: AtomicU8,
}

impl Edge {
    #[must_use]
    pub fn new(
        tail: impl Into<String>,
        head: impl Into<String>,
        source_handle: impl Into<String>,
    ) -> Self {
        Edge::with_id(Uuid::new_v4().to_string(), tail, head, source_handle)
    }

    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        tail: impl Into<String>,
        head: impl Into<String>,
        source_handle: impl Into<String>,
    ) -> Self {
        let mut handle = source_handle.into();
        if handle.is_empty() {
            handle = SOURCE_HANDLE_DEFAULT.to_string();
        }
        Edge {
            id: id.into(),
            tail: tail.into(),
            head: head.into(),
            source_handle: handle,
            state: AtomicU8::new(NodeState::Unknown.as_u8()),
        }
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_defaults_to_source() {
        let edge = Edge::with_id("e", "a", "b", "");
        assert_eq!(edge.source_handle, "source");
        assert_eq!(edge.state(), NodeState::Unknown);
    }

    #[test]
    fn state_transitions() {
        let edge = Edge::new("a", "b", "source");
        edge.set_state(NodeState::Taken);
        assert_eq!(edge.state(), NodeState::Taken);
        edge.set_state(NodeState::Skipped);
        assert_eq!(edge.state(), NodeState::Skipped);
    }
}
