//! The queue-driven graph engine.
//!
//! A bounded worker pool drains a ready queue of node ids; node events
//! flow through an internal event queue to a single dispatcher that
//! linearizes them onto the external [`GraphEvent`] stream. An atomic
//! pending counter tracks queued-plus-executing nodes and closes the
//! ready queue exactly once when it reaches zero; a command channel
//! carries abort/pause/resume, with the pause barrier modelled as a
//! watch flag workers block on between dequeue and execution.
//!
//! Ordering guarantees: events of one node are in order, the terminal
//! graph event is emitted strictly after every node event, and
//! `graph_run_started` is always first. Nothing is guaranteed across
//! nodes.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::config::EngineConfig;
use super::runtime_state::GraphRuntimeState;
use crate::context::ExecutionContext;
use crate::events::{EventKind, GraphEvent, NodeEvent};
use crate::graph::{Edge, Graph};
use crate::nodes::generate_execution_id;
use crate::recorder::NodeExecution;
use crate::types::{
    new_var_map, Command, ErrorStrategy, ExecutionClass, NodeExecutionStatus, NodeState, VarMap,
    BRANCH_OUTPUT_KEY, ERROR_OUTPUT_KEY, SOURCE_HANDLE_DEFAULT, SOURCE_HANDLE_FAIL_BRANCH,
    SOURCE_HANDLE_SUCCESS_BRANCH,
};

/// Queue-driven dispatcher over a workflow graph.
pub struct GraphEngine {
    graph: Arc<Graph>,
    runtime_state: Arc<GraphRuntimeState>,
    config: EngineConfig,

    ready_tx: Mutex<Option<flume::Sender<String>>>,
    ready_rx: flume::Receiver<String>,
    event_tx: Mutex<Option<flume::Sender<NodeEvent>>>,
    event_rx: flume::Receiver<NodeEvent>,
    command_tx: flume::Sender<Command>,
    command_rx: flume::Receiver<Command>,

    /// Dedup of dequeued node ids (idempotent enqueue protection).
    seen: DashSet<String>,
    /// Nodes whose execution has fully finished; merge-join gating reads
    /// this so a join target starts strictly after all predecessors end.
    completed: DashSet<String>,
    /// Nodes in the ready queue plus nodes currently executing.
    pending: AtomicI32,

    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,

    node_executions: Mutex<Vec<NodeExecution>>,
    node_starts: Mutex<FxHashMap<String, (DateTime<Utc>, String)>>,
}

impl GraphEngine {
    #[must_use]
    pub fn new(
        graph: Arc<Graph>,
        runtime_state: Arc<GraphRuntimeState>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = flume::bounded(graph.nodes.len() + 1);
        let (event_tx, event_rx) = flume::bounded(256);
        let (command_tx, command_rx) = flume::bounded(16);
        let (pause_tx, pause_rx) = watch::channel(false);

        Arc::new(GraphEngine {
            graph,
            runtime_state,
            config,
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx,
            event_tx: Mutex::new(Some(event_tx)),
            event_rx,
            command_tx,
            command_rx,
            seen: DashSet::new(),
            completed: DashSet::new(),
            pending: AtomicI32::new(0),
            pause_tx,
            pause_rx,
            node_executions: Mutex::new(Vec::new()),
            node_starts: Mutex::new(FxHashMap::default()),
        })
    }

    /// Execute the graph; the returned stream yields `graph_run_started`
    /// first and exactly one terminal event last, then closes.
    #[must_use]
    pub fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<GraphEvent> {
        let (output_tx, output_rx) = flume::bounded(64);
        tokio::spawn(async move {
            self.orchestrate(ctx, output_tx).await;
        });
        output_rx
    }

    /// Send a control command; dropped with a warning when the queue is
    /// full.
    pub fn send_command(&self, command: Command) {
        if let Err(err) = self.command_tx.try_send(command) {
            tracing::warn!(error = %err, "command channel full, command dropped");
        }
    }

    pub fn abort(&self) {
        self.send_command(Command::Abort {
            reason: "aborted by user".to_string(),
        });
    }

    pub fn pause(&self) {
        self.send_command(Command::Pause {
            reason: "paused by user".to_string(),
        });
    }

    pub fn resume(&self) {
        self.send_command(Command::Resume);
    }

    /// Node execution records collected so far.
    #[must_use]
    pub fn node_executions(&self) -> Vec<NodeExecution> {
        self.node_executions
            .lock()
            .expect("node executions poisoned")
            .clone()
    }

    #[instrument(skip_all)]
    async fn orchestrate(self: Arc<Self>, ctx: ExecutionContext, output_tx: flume::Sender<GraphEvent>) {
        self.runtime_state.execution().start();
        let _ = output_tx.send_async(GraphEvent::run_started()).await;

        let cancel = ctx.cancellation.child_token();
        let ctx = ctx.with_cancellation(cancel.clone());

        let root = self.graph.root_node();
        if root.state() == NodeState::Skipped {
            let _ = output_tx
                .send_async(GraphEvent::run_failed("root node is skipped", 0, vec![]))
                .await;
            return;
        }

        // Root goes in before any worker starts; counter first, then the
        // queue write.
        self.pending.fetch_add(1, Ordering::AcqRel);
        {
            let sender = self
                .ready_tx
                .lock()
                .expect("ready queue poisoned")
                .clone();
            if let Some(sender) = sender {
                let _ = sender.send_async(self.graph.root_id.clone()).await;
            }
        }

        let command_handler = tokio::spawn({
            let engine = self.clone();
            let cancel = cancel.clone();
            async move { engine.command_handler(cancel).await }
        });

        let event_tx = self
            .event_tx
            .lock()
            .expect("event queue poisoned")
            .clone()
            .expect("event queue already closed");

        let mut workers = JoinSet::new();
        for _ in 0..self.config.max_workers.max(1) {
            let engine = self.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let event_tx = event_tx.clone();
            let pause_rx = self.pause_rx.clone();
            workers.spawn(async move {
                engine.worker(ctx, cancel, event_tx, pause_rx).await;
            });
        }
        drop(event_tx);

        let dispatcher = tokio::spawn({
            let engine = self.clone();
            let cancel = cancel.clone();
            let output_tx = output_tx.clone();
            async move { engine.dispatcher(cancel, output_tx).await }
        });

        while workers.join_next().await.is_some() {}
        // All workers are gone; close the event queue so the dispatcher
        // drains and exits.
        self.event_tx.lock().expect("event queue poisoned").take();
        let _ = dispatcher.await;

        let node_executions = self.node_executions();
        let execution = self.runtime_state.execution();
        let terminal = if execution.is_aborted() {
            GraphEvent::run_aborted("workflow execution aborted", node_executions)
        } else if execution.has_error() {
            let error = execution.error().unwrap_or_else(|| "unknown error".to_string());
            GraphEvent::run_failed(error, execution.exceptions_count(), node_executions)
        } else {
            GraphEvent::run_succeeded(self.runtime_state.outputs(), node_executions)
        };
        let _ = output_tx.send_async(terminal).await;

        execution.complete();
        command_handler.abort();
    }

    async fn command_handler(self: Arc<Self>, cancel: CancellationToken) {
        while let Ok(command) = self.command_rx.recv_async().await {
            match command {
                Command::Abort { reason } => {
                    tracing::info!(reason = %reason, "received abort command");
                    self.runtime_state.execution().abort(&reason);
                    cancel.cancel();
                }
                Command::Pause { reason } => {
                    tracing::info!(reason = %reason, "received pause command");
                    self.pause_tx.send_replace(true);
                    self.runtime_state.execution().pause();
                }
                Command::Resume => {
                    tracing::info!("received resume command");
                    self.pause_tx.send_replace(false);
                    self.runtime_state.execution().resume();
                }
            }
        }
    }

    /// Block while paused; false when cancellation interrupted the wait.
    async fn check_paused(
        &self,
        pause_rx: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> bool {
        if !*pause_rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            result = pause_rx.wait_for(|paused| !*paused) => result.is_ok(),
        }
    }

    async fn worker(
        self: Arc<Self>,
        ctx: ExecutionContext,
        cancel: CancellationToken,
        event_tx: flume::Sender<NodeEvent>,
        mut pause_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                message = self.ready_rx.recv_async() => {
                    let Ok(node_id) = message else { return };

                    if !self.check_paused(&mut pause_rx, &cancel).await {
                        self.node_finished();
                        return;
                    }

                    // Idempotent enqueue protection.
                    if !self.seen.insert(node_id.clone()) {
                        self.node_finished();
                        continue;
                    }

                    self.execute_node(&ctx, &cancel, &event_tx, &node_id).await;
                    self.node_finished();
                }
            }
        }
    }

    async fn enqueue_node(&self, node_id: &str) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let sender = self.ready_tx.lock().expect("ready queue poisoned").clone();
        if let Some(sender) = sender {
            // The calling worker still holds a pending slot, so the queue
            // cannot close concurrently; a full queue just parks briefly.
            let _ = sender.send_async(node_id.to_string()).await;
        } else {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// One unit of queued work is done; the last one out closes the
    /// ready queue.
    fn node_finished(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.ready_tx.lock().expect("ready queue poisoned").take();
        }
    }

    async fn execute_node(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        event_tx: &flume::Sender<NodeEvent>,
        node_id: &str,
    ) {
        let Some(node) = self.graph.nodes.get(node_id).cloned() else {
            tracing::error!(node_id = %node_id, "node not found");
            return;
        };

        // Skipped nodes fan out with nil outputs so merge gating can
        // resolve; their edges are already marked Skipped.
        if node.state() == NodeState::Skipped {
            tracing::debug!(node_id = %node_id, "skipping node");
            self.completed.insert(node_id.to_string());
            self.process_edges(node_id, None, false).await;
            return;
        }

        if self.runtime_state.node_run_steps() >= self.config.max_node_steps {
            tracing::error!(node_id = %node_id, "max node steps exceeded");
            self.runtime_state.execution().fail(format!(
                "max node steps ({}) exceeded",
                self.config.max_node_steps
            ));
            self.completed.insert(node_id.to_string());
            return;
        }

        self.runtime_state.increment_node_run_steps();
        node.set_state(NodeState::Taken);

        let mut max_attempts = 1u32;
        let mut retry_interval = Duration::ZERO;
        if node.error_strategy() == ErrorStrategy::Retry {
            if let Some(policy) = node.retry_policy() {
                if policy.max_retries > 0 {
                    max_attempts = policy.max_retries + 1;
                    retry_interval = Duration::from_millis(policy.retry_interval);
                }
            }
        }

        let mut last_outputs: Option<VarMap> = None;
        let mut node_err = String::new();
        let mut succeeded = false;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tracing::info!(
                    node_id = %node_id,
                    attempt = attempt + 1,
                    max = max_attempts,
                    "retrying node"
                );
                if !retry_interval.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.completed.insert(node_id.to_string());
                            return;
                        }
                        _ = tokio::time::sleep(retry_interval) => {}
                    }
                }
            }

            match self.run_node_once(ctx, event_tx, &node).await {
                Ok(outputs) => {
                    last_outputs = outputs;
                    succeeded = true;
                    break;
                }
                Err(err) => node_err = err,
            }
        }

        if !succeeded {
            match node.error_strategy() {
                ErrorStrategy::FailBranch => {
                    tracing::info!(node_id = %node_id, "node failed, following fail-branch");
                    let _ = event_tx
                        .send_async(NodeEvent::run_failed(
                            generate_execution_id(),
                            node_id,
                            node.node_type(),
                            node_err.clone(),
                        ))
                        .await;
                    let mut error_outputs = new_var_map();
                    error_outputs.insert(
                        ERROR_OUTPUT_KEY.to_string(),
                        serde_json::Value::String(node_err),
                    );
                    self.runtime_state
                        .variable_pool
                        .set_node_outputs(node_id, error_outputs);
                    self.completed.insert(node_id.to_string());
                    self.process_edges(node_id, None, true).await;
                }
                ErrorStrategy::DefaultValue => {
                    tracing::info!(node_id = %node_id, "node failed, using default value");
                    let defaults = node.default_value().unwrap_or_default();
                    self.runtime_state
                        .variable_pool
                        .set_node_outputs(node_id, defaults.clone());

                    let mut metadata = new_var_map();
                    metadata.insert(
                        "used_default_value".to_string(),
                        serde_json::Value::Bool(true),
                    );
                    let event = NodeEvent::run_succeeded(
                        generate_execution_id(),
                        node_id,
                        node.node_type(),
                        defaults.clone(),
                    )
                    .with_metadata(metadata);
                    let _ = event_tx.send_async(event).await;

                    self.completed.insert(node_id.to_string());
                    self.process_edges(node_id, Some(&defaults), false).await;
                }
                _ => {
                    tracing::error!(node_id = %node_id, error = %node_err, "node failed");
                    self.runtime_state
                        .execution()
                        .fail(format!("node {node_id} failed: {node_err}"));
                    let _ = event_tx
                        .send_async(NodeEvent::run_failed(
                            generate_execution_id(),
                            node_id,
                            node.node_type(),
                            node_err,
                        ))
                        .await;
                    self.completed.insert(node_id.to_string());
                }
            }
            return;
        }

        if let Some(outputs) = &last_outputs {
            self.runtime_state
                .variable_pool
                .set_node_outputs(node_id, outputs.clone());
        }

        self.completed.insert(node_id.to_string());
        self.process_edges(node_id, last_outputs.as_ref(), false).await;
    }

    /// One attempt: run the node under the per-node deadline, forwarding
    /// every event except `failed`, whose handling belongs to the error
    /// policy above.
    async fn run_node_once(
        &self,
        ctx: &ExecutionContext,
        event_tx: &flume::Sender<NodeEvent>,
        node: &Arc<dyn crate::nodes::WorkflowNode>,
    ) -> Result<Option<VarMap>, String> {
        let rx = node.clone().run(ctx.clone()).await;

        let collect = async {
            let mut last_outputs: Option<VarMap> = None;
            let mut failure: Option<String> = None;
            while let Ok(event) = rx.recv_async().await {
                match event.kind {
                    EventKind::NodeRunFailed => {
                        failure = Some(event.error.unwrap_or_else(|| "node failed".to_string()));
                    }
                    _ => {
                        if event.kind == EventKind::NodeRunSucceeded {
                            last_outputs = event.outputs.clone();
                        }
                        let _ = event_tx.send_async(event).await;
                    }
                }
            }
            (last_outputs, failure)
        };

        match tokio::time::timeout(self.config.node_timeout, collect).await {
            Ok((outputs, None)) => Ok(outputs),
            Ok((_, Some(err))) => Err(err),
            Err(_) => Err(format!(
                "node execution timed out after {}s",
                self.config.node_timeout.as_secs()
            )),
        }
    }

    /// Fan out over the node's outgoing edges, marking skipped branches
    /// and enqueueing targets whose merge gate has resolved.
    async fn process_edges(&self, node_id: &str, outputs: Option<&VarMap>, node_failed: bool) {
        for edge in self.graph.outgoing_edges(node_id) {
            if edge.state() == NodeState::Skipped {
                continue;
            }

            let Some(target) = self.graph.nodes.get(&edge.head) else {
                continue;
            };

            if !should_follow_edge(&edge, outputs, node_failed) {
                edge.set_state(NodeState::Skipped);
                self.propagate_skip(&edge.head);
                continue;
            }

            if !self.all_required_in_edges_ready(&edge.head) {
                // A later-arriving predecessor re-checks and enqueues.
                continue;
            }

            edge.set_state(NodeState::Taken);

            if target.state() != NodeState::Skipped {
                self.enqueue_node(&edge.head).await;
            }
        }
    }

    /// Merge-join gate: every non-skipped incoming edge must originate
    /// from a node that has finished executing.
    fn all_required_in_edges_ready(&self, node_id: &str) -> bool {
        let in_edges = self.graph.incoming_edges(node_id);
        if in_edges.len() <= 1 {
            return true;
        }
        for edge in in_edges {
            if edge.state() == NodeState::Skipped {
                continue;
            }
            if !self.completed.contains(&edge.tail) {
                return false;
            }
        }
        true
    }

    /// A node becomes Skipped iff every incoming edge is Skipped; the
    /// marking then cascades through its outgoing edges.
    fn propagate_skip(&self, node_id: &str) {
        let Some(node) = self.graph.nodes.get(node_id) else {
            return;
        };

        let all_skipped = self
            .graph
            .incoming_edges(node_id)
            .iter()
            .all(|edge| edge.state() == NodeState::Skipped);
        if !all_skipped {
            return;
        }

        node.set_state(NodeState::Skipped);

        for edge in self.graph.outgoing_edges(node_id) {
            edge.set_state(NodeState::Skipped);
            self.propagate_skip(&edge.head);
        }
    }

    /// Project internal node events onto the external stream, recording
    /// timings and node-execution records along the way. On abort the
    /// queue keeps draining (so producers never block) but nothing more
    /// is forwarded.
    async fn dispatcher(
        self: Arc<Self>,
        cancel: CancellationToken,
        output_tx: flume::Sender<GraphEvent>,
    ) {
        while let Ok(event) = self.event_rx.recv_async().await {
            let mut graph_event = GraphEvent {
                kind: event.kind,
                node_id: Some(event.node_id.clone()),
                chunk: None,
                outputs: None,
                error: None,
                exceptions_count: None,
                node_executions: None,
            };

            match event.kind {
                EventKind::NodeRunStarted => {
                    tracing::debug!(
                        node_id = %event.node_id,
                        node_type = %event.node_type,
                        title = %event.node_title,
                        "node started"
                    );
                    let started = event.start_at.unwrap_or_else(Utc::now);
                    self.node_starts
                        .lock()
                        .expect("node starts poisoned")
                        .insert(event.node_id.clone(), (started, event.node_title.clone()));
                }
                EventKind::NodeRunSucceeded => {
                    tracing::debug!(node_id = %event.node_id, "node succeeded");

                    if let Some(node) = self.graph.nodes.get(&event.node_id) {
                        if node.execution_class() == ExecutionClass::Response {
                            if let Some(outputs) = &event.outputs {
                                self.runtime_state.update_outputs(outputs.clone());
                            }
                        }
                    }
                    if let Some(tokens) = event
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("total_tokens"))
                        .and_then(serde_json::Value::as_u64)
                    {
                        self.runtime_state.add_tokens(tokens);
                    }

                    self.add_node_execution(&event, NodeExecutionStatus::Succeeded);
                }
                EventKind::NodeRunFailed => {
                    tracing::error!(
                        node_id = %event.node_id,
                        error = event.error.as_deref().unwrap_or(""),
                        "node failed"
                    );
                    self.runtime_state.execution().increment_exceptions();
                    graph_event.error = event.error.clone();

                    self.add_node_execution(&event, NodeExecutionStatus::Failed);
                }
                EventKind::NodeStreamChunk => {
                    graph_event.chunk = event.chunk.clone();
                }
                _ => {}
            }

            if cancel.is_cancelled() {
                continue;
            }
            let _ = output_tx.send_async(graph_event).await;
        }
    }

    fn add_node_execution(&self, event: &NodeEvent, status: NodeExecutionStatus) {
        let (started_at, title) = self
            .node_starts
            .lock()
            .expect("node starts poisoned")
            .get(&event.node_id)
            .cloned()
            .unwrap_or_else(|| (Utc::now(), event.node_title.clone()));
        let elapsed_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        let record = NodeExecution {
            node_id: event.node_id.clone(),
            node_type: event.node_type.as_str().to_string(),
            title,
            status,
            outputs: event.outputs.clone(),
            error: event.error.clone(),
            metadata: event.metadata.clone(),
            started_at,
            elapsed_ms,
        };

        self.node_executions
            .lock()
            .expect("node executions poisoned")
            .push(record);
    }
}

/// Decide whether an edge is followed given the completed node's outputs
/// and failure flag.
fn should_follow_edge(edge: &Edge, outputs: Option<&VarMap>, node_failed: bool) -> bool {
    if edge.source_handle == SOURCE_HANDLE_DEFAULT {
        return !node_failed;
    }
    if edge.source_handle == SOURCE_HANDLE_FAIL_BRANCH {
        return node_failed;
    }
    if edge.source_handle == SOURCE_HANDLE_SUCCESS_BRANCH {
        return !node_failed;
    }

    // Conditional branch: follow iff the branch output matches the
    // handle.
    if let Some(outputs) = outputs {
        if let Some(branch) = outputs.get(BRANCH_OUTPUT_KEY) {
            let branch = match branch {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return branch == edge.source_handle;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(handle: &str) -> Edge {
        Edge::with_id("e", "a", "b", handle)
    }

    #[test]
    fn default_handle_follows_success_only() {
        assert!(should_follow_edge(&edge("source"), None, false));
        assert!(!should_follow_edge(&edge("source"), None, true));
    }

    #[test]
    fn fail_branch_handles() {
        assert!(should_follow_edge(&edge("fail-branch"), None, true));
        assert!(!should_follow_edge(&edge("fail-branch"), None, false));
        assert!(should_follow_edge(&edge("success-branch"), None, false));
        assert!(!should_follow_edge(&edge("success-branch"), None, true));
    }

    #[test]
    fn conditional_handle_matches_branch_output() {
        let mut outputs = new_var_map();
        outputs.insert(
            BRANCH_OUTPUT_KEY.to_string(),
            serde_json::Value::String("adult".to_string()),
        );
        assert!(should_follow_edge(&edge("adult"), Some(&outputs), false));
        assert!(!should_follow_edge(&edge("minor"), Some(&outputs), false));
    }

    #[test]
    fn conditional_handle_without_branch_output_follows() {
        let outputs = new_var_map();
        assert!(should_follow_edge(&edge("whatever"), Some(&outputs), false));
        assert!(should_follow_edge(&edge("whatever"), None, false));
    }
}
