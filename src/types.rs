//! Core types for the FlowWeave workflow runtime.
//!
//! This module defines the fundamental vocabulary used throughout the
//! system: node type tags, execution classification, per-node run state,
//! error strategies, engine commands, run status, variable selectors, and
//! the tenant scope that gates all multi-tenant reads and writes.
//!
//! # Key Types
//!
//! - [`NodeType`]: the DSL type tag identifying a node implementation
//! - [`ExecutionClass`]: how the scheduler treats a node (root, response, ...)
//! - [`NodeState`]: mutable execution state shared by nodes and edges
//! - [`ErrorStrategy`]: per-node failure policy consulted by the scheduler
//! - [`VariableSelector`]: the `[node_id, variable_name]` pair used to read
//!   values out of the variable pool
//! - [`TenantScope`]: the `(org_id, tenant_id)` pair for tenant isolation

use serde::{Deserialize, Serialize};
use std::fmt;

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Map shape used for node outputs, variable-pool sub-maps and metadata.
pub type VarMap = FxHashMap<String, Value>;

/// Create an empty [`VarMap`].
#[must_use]
pub fn new_var_map() -> VarMap {
    FxHashMap::default()
}

/// The DSL type tag of a workflow node.
///
/// Known built-in tags get their own variant; anything else is carried as
/// [`NodeType::Other`] so unknown tags survive a decode/encode round-trip
/// and can be rejected with a useful message at graph construction.
///
/// # Examples
///
/// ```rust
/// use flowweave::types::NodeType;
///
/// assert_eq!(NodeType::from("llm"), NodeType::Llm);
/// assert_eq!(NodeType::IfElse.as_str(), "if-else");
/// assert_eq!(NodeType::from("my-plugin"), NodeType::Other("my-plugin".into()));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Start,
    End,
    Answer,
    Llm,
    IfElse,
    Function,
    TemplateTransform,
    HttpRequest,
    Iteration,
    IterationStart,
    /// Annotation-only node dropped during graph construction.
    CustomNote,
    Other(String),
}

impl NodeType {
    /// The DSL string form of this tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Answer => "answer",
            NodeType::Llm => "llm",
            NodeType::IfElse => "if-else",
            NodeType::Function => "func",
            NodeType::TemplateTransform => "template-transform",
            NodeType::HttpRequest => "http-request",
            NodeType::Iteration => "iteration",
            NodeType::IterationStart => "iteration-start",
            NodeType::CustomNote => "custom-note",
            NodeType::Other(s) => s,
        }
    }

    /// Whether this tag may serve as the workflow entry point.
    #[must_use]
    pub fn is_start_node(&self) -> bool {
        matches!(self, NodeType::Start)
    }
}

impl From<&str> for NodeType {
    fn from(s: &str) -> Self {
        match s {
            "start" => NodeType::Start,
            "end" => NodeType::End,
            "answer" => NodeType::Answer,
            "llm" => NodeType::Llm,
            "if-else" => NodeType::IfElse,
            "func" => NodeType::Function,
            "template-transform" => NodeType::TemplateTransform,
            "http-request" => NodeType::HttpRequest,
            "iteration" => NodeType::Iteration,
            "iteration-start" => NodeType::IterationStart,
            "custom-note" => NodeType::CustomNote,
            other => NodeType::Other(other.to_string()),
        }
    }
}

impl From<String> for NodeType {
    fn from(s: String) -> Self {
        NodeType::from(s.as_str())
    }
}

impl From<NodeType> for String {
    fn from(nt: NodeType) -> Self {
        nt.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution classification consulted by the scheduler and dispatcher.
///
/// - `Root` nodes are workflow entry points; when the DSL lists several,
///   only one stays active and the rest are preemptively skipped.
/// - `Response` node outputs are merged into the run outputs.
/// - `Branch` nodes steer fan-out via the `__branch__` output field.
/// - `Container` nodes manage repeated execution over a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionClass {
    Root,
    Executable,
    Response,
    Branch,
    Container,
}

/// Mutable run state shared by nodes and edges.
///
/// Stored behind an atomic cell so workers and the skip-propagation pass
/// can update it concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Unknown,
    Taken,
    Skipped,
}

impl NodeState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            NodeState::Unknown => 0,
            NodeState::Taken => 1,
            NodeState::Skipped => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeState::Taken,
            2 => NodeState::Skipped,
            _ => NodeState::Unknown,
        }
    }
}

/// Per-node failure policy.
///
/// The retry bounds live in [`crate::dsl::RetryPolicy`]; the strategy tag
/// only selects which path the scheduler takes once attempts are
/// exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    #[default]
    #[serde(rename = "none", alias = "")]
    None,
    FailBranch,
    DefaultValue,
    Retry,
}

/// Reserved `source_handle` values for error-strategy branching.
pub const SOURCE_HANDLE_DEFAULT: &str = "source";
pub const SOURCE_HANDLE_FAIL_BRANCH: &str = "fail-branch";
pub const SOURCE_HANDLE_SUCCESS_BRANCH: &str = "success-branch";

/// Output key carrying the selected branch id on branch-class nodes.
pub const BRANCH_OUTPUT_KEY: &str = "__branch__";

/// Output key carrying the failure message on fail-branch fan-out.
pub const ERROR_OUTPUT_KEY: &str = "__error__";

/// Control command accepted by a running graph engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Abort { reason: String },
    Pause { reason: String },
    Resume,
}

/// Terminal-aware status of a workflow run.
///
/// Transitions are `Running -> {Succeeded, Failed, Aborted}` only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// Terminal status of a single node execution record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeExecutionStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// A `[node_id, variable_name]` reference into the variable pool.
///
/// The DSL encodes selectors as two-element JSON arrays; extra elements
/// are tolerated and ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableSelector(pub Vec<String>);

impl VariableSelector {
    /// Build a selector from node id and variable name.
    #[must_use]
    pub fn new(node_id: impl Into<String>, name: impl Into<String>) -> Self {
        VariableSelector(vec![node_id.into(), name.into()])
    }

    /// The node id component, empty when the selector is malformed.
    #[must_use]
    pub fn node_id(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// The variable-name component, empty when the selector is malformed.
    #[must_use]
    pub fn var_name(&self) -> &str {
        self.0.get(1).map(String::as_str).unwrap_or("")
    }

    /// A selector is usable once it carries both components.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0.len() >= 2
    }
}

/// The `(org_id, tenant_id)` pair gating all tenant-isolated reads and
/// writes. Background work spawned on behalf of a request copies this
/// scope into its own context so async persistence and memory writes
/// inherit the caller's tenant identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub org_id: String,
    pub tenant_id: String,
}

impl TenantScope {
    #[must_use]
    pub fn new(org_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        TenantScope {
            org_id: org_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org_id, self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_through_strings() {
        for tag in [
            "start",
            "end",
            "answer",
            "llm",
            "if-else",
            "func",
            "template-transform",
            "http-request",
            "iteration",
        ] {
            let nt = NodeType::from(tag);
            assert_eq!(nt.as_str(), tag);
        }
        assert_eq!(
            NodeType::from("vendor-widget"),
            NodeType::Other("vendor-widget".into())
        );
    }

    #[test]
    fn selector_components() {
        let sel = VariableSelector::new("start_1", "name");
        assert_eq!(sel.node_id(), "start_1");
        assert_eq!(sel.var_name(), "name");
        assert!(sel.is_valid());
        assert!(!VariableSelector(vec!["only".into()]).is_valid());
    }

    #[test]
    fn error_strategy_deserializes_kebab_case() {
        let s: ErrorStrategy = serde_json::from_str("\"fail-branch\"").unwrap();
        assert_eq!(s, ErrorStrategy::FailBranch);
        let s: ErrorStrategy = serde_json::from_str("\"default-value\"").unwrap();
        assert_eq!(s, ErrorStrategy::DefaultValue);
        let s: ErrorStrategy = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(s, ErrorStrategy::Retry);
    }

    #[test]
    fn node_state_atomic_encoding() {
        for s in [NodeState::Unknown, NodeState::Taken, NodeState::Skipped] {
            assert_eq!(NodeState::from_u8(s.as_u8()), s);
        }
    }
}
