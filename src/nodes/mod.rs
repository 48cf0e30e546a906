//! The node execution contract and the built-in node set.
//!
//! Every node exposes identity and classification metadata plus a
//! [`run`](WorkflowNode::run) method that returns a channel of
//! [`NodeEvent`]s: `started` once, zero or more `stream_chunk`s, then
//! exactly one of `succeeded` | `failed`, after which the channel closes.
//! Nodes read their inputs through the variable pool (selectors declared
//! in the DSL), never through call arguments; outputs travel on the
//! `succeeded` event.
//!
//! The [`run_with_events`] / [`run_stream_with_events`] wrappers take
//! care of the event envelope so concrete nodes only implement their
//! executor body.

pub mod answer;
pub mod end;
pub mod function;
pub mod http_request;
pub mod if_else;
pub mod iteration;
pub mod llm;
pub mod registry;
pub mod start;
pub mod template;

pub use registry::{NodeConstructor, NodeRegistry};

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::dsl::{NodeData, RetryPolicy};
use crate::events::NodeEvent;
use crate::provider::ProviderError;
use crate::types::{ErrorStrategy, ExecutionClass, NodeExecutionStatus, NodeState, NodeType, VarMap};

/// Errors raised while constructing a node from its DSL payload.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeBuildError {
    #[error("invalid config for node {node_id}: {message}")]
    #[diagnostic(
        code(flowweave::nodes::invalid_config),
        help("Check the node's data payload against its declared type.")
    )]
    InvalidConfig { node_id: String, message: String },

    #[error("unknown node type: {node_type} (node id: {node_id})")]
    #[diagnostic(code(flowweave::nodes::unknown_type))]
    UnknownType { node_id: String, node_type: String },

    #[error("failed to parse data for node {node_id}: {source}")]
    #[diagnostic(code(flowweave::nodes::parse))]
    Parse {
        node_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl NodeBuildError {
    pub(crate) fn invalid(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        NodeBuildError::InvalidConfig {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

/// Fatal errors raised by a node executor body.
///
/// Soft failures (the node ran but the outcome is a failure the error
/// strategy should route) are expressed as [`NodeRunResult::failed`]
/// instead.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("{0}")]
    #[diagnostic(code(flowweave::nodes::run))]
    Message(String),

    #[error(transparent)]
    #[diagnostic(code(flowweave::nodes::serde))]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(flowweave::nodes::provider))]
    Provider(#[from] ProviderError),

    #[error("execution cancelled")]
    #[diagnostic(code(flowweave::nodes::cancelled))]
    Cancelled,
}

impl NodeError {
    pub(crate) fn msg(m: impl Into<String>) -> Self {
        NodeError::Message(m.into())
    }
}

/// Terminal outcome of one node executor run.
#[derive(Clone, Debug)]
pub struct NodeRunResult {
    pub status: NodeExecutionStatus,
    pub outputs: Option<VarMap>,
    pub error: Option<String>,
    pub metadata: Option<VarMap>,
}

impl NodeRunResult {
    #[must_use]
    pub fn succeeded(outputs: VarMap) -> Self {
        NodeRunResult {
            status: NodeExecutionStatus::Succeeded,
            outputs: Some(outputs),
            error: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        NodeRunResult {
            status: NodeExecutionStatus::Failed,
            outputs: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    /// A failure that still carries outputs (e.g. an HTTP response with
    /// status ≥ 400).
    #[must_use]
    pub fn failed_with_outputs(error: impl Into<String>, outputs: VarMap) -> Self {
        NodeRunResult {
            status: NodeExecutionStatus::Failed,
            outputs: Some(outputs),
            error: Some(error.into()),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: VarMap) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Common fields composed into every built-in node.
#[derive(Debug)]
pub struct BaseNode {
    id: String,
    node_type: NodeType,
    title: String,
    execution_class: ExecutionClass,
    state: AtomicU8,
    error_strategy: ErrorStrategy,
    default_value: Option<VarMap>,
    retry: Option<RetryPolicy>,
}

impl BaseNode {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        node_type: NodeType,
        title: impl Into<String>,
        execution_class: ExecutionClass,
    ) -> Self {
        BaseNode {
            id: id.into(),
            node_type,
            title: title.into(),
            execution_class,
            state: AtomicU8::new(NodeState::Unknown.as_u8()),
            error_strategy: ErrorStrategy::None,
            default_value: None,
            retry: None,
        }
    }

    /// Apply the error-strategy envelope from the common DSL fields.
    #[must_use]
    pub fn with_strategy_from(mut self, data: &NodeData) -> Self {
        if let Some(strategy) = data.error_strategy {
            self.error_strategy = strategy;
        }
        self.default_value = data.default_value.clone();
        self.retry = data.retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type.clone()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn execution_class(&self) -> ExecutionClass {
        self.execution_class
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn error_strategy(&self) -> ErrorStrategy {
        self.error_strategy
    }

    pub fn default_value(&self) -> Option<&VarMap> {
        self.default_value.as_ref()
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }
}

/// The execution contract every workflow node implements.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    fn id(&self) -> &str;
    fn node_type(&self) -> NodeType;
    fn title(&self) -> &str;
    fn execution_class(&self) -> ExecutionClass;
    fn state(&self) -> NodeState;
    fn set_state(&self, state: NodeState);
    fn error_strategy(&self) -> ErrorStrategy;
    fn default_value(&self) -> Option<VarMap>;
    fn retry_policy(&self) -> Option<RetryPolicy>;

    /// Execute the node; events arrive on the returned channel.
    async fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<NodeEvent>;
}

/// Forward the [`BaseNode`] getters for a node type with a `base` field.
macro_rules! delegate_base {
    () => {
        fn id(&self) -> &str {
            self.base.id()
        }
        fn node_type(&self) -> crate::types::NodeType {
            self.base.node_type()
        }
        fn title(&self) -> &str {
            self.base.title()
        }
        fn execution_class(&self) -> crate::types::ExecutionClass {
            self.base.execution_class()
        }
        fn state(&self) -> crate::types::NodeState {
            self.base.state()
        }
        fn set_state(&self, state: crate::types::NodeState) {
            self.base.set_state(state)
        }
        fn error_strategy(&self) -> crate::types::ErrorStrategy {
            self.base.error_strategy()
        }
        fn default_value(&self) -> Option<crate::types::VarMap> {
            self.base.default_value().cloned()
        }
        fn retry_policy(&self) -> Option<crate::dsl::RetryPolicy> {
            self.base.retry_policy()
        }
    };
}
pub(crate) use delegate_base;

/// Generate a fresh execution id for one node attempt.
#[must_use]
pub fn generate_execution_id() -> String {
    Uuid::new_v4().to_string()
}

/// Wrap a non-streaming executor in the event envelope.
///
/// Emits `started`, awaits `exec`, then emits the matching terminal
/// event and closes the channel. Send failures are ignored: a dropped
/// receiver means the engine stopped listening (timeout or abort).
pub fn run_with_events<Fut>(
    node_id: String,
    node_type: NodeType,
    title: String,
    exec: Fut,
) -> flume::Receiver<NodeEvent>
where
    Fut: Future<Output = Result<NodeRunResult, NodeError>> + Send + 'static,
{
    let (tx, rx) = flume::bounded(16);
    tokio::spawn(async move {
        let execution_id = generate_execution_id();
        let _ = tx
            .send_async(NodeEvent::run_started(
                &execution_id,
                &node_id,
                node_type.clone(),
                title,
            ))
            .await;
        let event = terminal_event(&execution_id, &node_id, node_type, exec.await);
        let _ = tx.send_async(event).await;
    });
    rx
}

/// Wrap a streaming executor in the event envelope.
///
/// The executor receives a chunk sender; every chunk is forwarded as a
/// `stream_chunk` event before the terminal event is emitted.
pub fn run_stream_with_events<F, Fut>(
    node_id: String,
    node_type: NodeType,
    title: String,
    exec: F,
) -> flume::Receiver<NodeEvent>
where
    F: FnOnce(flume::Sender<String>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<NodeRunResult, NodeError>> + Send + 'static,
{
    let (tx, rx) = flume::bounded(64);
    tokio::spawn(async move {
        let execution_id = generate_execution_id();
        let _ = tx
            .send_async(NodeEvent::run_started(
                &execution_id,
                &node_id,
                node_type.clone(),
                title,
            ))
            .await;

        let (chunk_tx, chunk_rx) = flume::bounded::<String>(32);
        let executor = tokio::spawn(exec(chunk_tx));

        while let Ok(chunk) = chunk_rx.recv_async().await {
            let _ = tx
                .send_async(NodeEvent::stream_chunk(
                    &execution_id,
                    &node_id,
                    node_type.clone(),
                    chunk,
                ))
                .await;
        }

        let result = match executor.await {
            Ok(result) => result,
            Err(join_err) => Err(NodeError::msg(format!("node task panicked: {join_err}"))),
        };
        let event = terminal_event(&execution_id, &node_id, node_type, result);
        let _ = tx.send_async(event).await;
    });
    rx
}

fn terminal_event(
    execution_id: &str,
    node_id: &str,
    node_type: NodeType,
    result: Result<NodeRunResult, NodeError>,
) -> NodeEvent {
    match result {
        Err(err) => NodeEvent::run_failed(execution_id, node_id, node_type, err.to_string()),
        Ok(result) => match result.status {
            NodeExecutionStatus::Failed => {
                let mut event = NodeEvent::run_failed(
                    execution_id,
                    node_id,
                    node_type,
                    result.error.unwrap_or_else(|| "node failed".to_string()),
                );
                event.outputs = result.outputs;
                event
            }
            _ => {
                let mut event = NodeEvent::run_succeeded(
                    execution_id,
                    node_id,
                    node_type,
                    result.outputs.unwrap_or_default(),
                );
                event.metadata = result.metadata;
                event
            }
        },
    }
}
