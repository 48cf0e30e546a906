//! The workflow runner: DSL in, event stream out.
//!
//! Wires a parsed DSL document into a graph, seeds the variable pool's
//! `sys` namespace from the inputs, assembles the execution context
//! (providers, functions, tools, memory, tenant scope), asserts
//! conversation ownership before any engine or memory work, and hands
//! the graph to the engine. [`WorkflowRunner::run_sync`] drains the
//! stream into a [`RunResult`] and dispatches persistence off the hot
//! path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::context::ExecutionContext;
use crate::dsl::GraphConfig;
use crate::engine::{EngineConfig, GraphEngine, GraphRuntimeState};
use crate::events::{EventKind, GraphEvent};
use crate::graph::{Graph, GraphBuildError};
use crate::memory::MemoryCoordinator;
use crate::nodes::function::FunctionRegistry;
use crate::nodes::NodeRegistry;
use crate::provider::ProviderRegistry;
use crate::recorder::{NodeExecution, RecorderError, RunRecorder, WorkflowRun};
use crate::tool::ToolRegistry;
use crate::types::{RunStatus, TenantScope, VarMap};
use crate::vars::VariablePool;

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("failed to parse workflow DSL: {0}")]
    #[diagnostic(code(flowweave::runner::dsl))]
    Dsl(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphBuildError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Recorder(#[from] RecorderError),
}

/// Per-run options.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Workflow id recorded on the run aggregate.
    pub workflow_id: Option<String>,
    /// Conversation the run belongs to (memory + ownership gating).
    pub conversation_id: Option<String>,
    /// Tenant scope propagated to persistence and background memory.
    pub scope: Option<TenantScope>,
    /// Overall run deadline; the run is aborted when it elapses.
    pub run_timeout: Option<Duration>,
    /// External cancellation (e.g. a dropped HTTP request).
    pub cancellation: Option<CancellationToken>,
}

/// Result of a synchronous run.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub outputs: VarMap,
    pub error: Option<String>,
    pub node_executions: Vec<NodeExecution>,
}

/// A started run: the event stream plus the handles to steer it.
pub struct RunningWorkflow {
    pub events: flume::Receiver<GraphEvent>,
    pub engine: Arc<GraphEngine>,
    pub run: WorkflowRun,
    runtime_state: Arc<GraphRuntimeState>,
}

/// Entry point for executing workflows.
pub struct WorkflowRunner {
    engine_config: EngineConfig,
    registry: Arc<NodeRegistry>,
    providers: Arc<ProviderRegistry>,
    functions: Arc<FunctionRegistry>,
    memory: Option<Arc<MemoryCoordinator>>,
    tools: Option<Arc<ToolRegistry>>,
    recorder: Option<Arc<RunRecorder>>,
}

impl WorkflowRunner {
    #[must_use]
    pub fn new(engine_config: EngineConfig) -> Self {
        WorkflowRunner {
            engine_config,
            registry: Arc::new(NodeRegistry::with_builtins()),
            providers: Arc::new(ProviderRegistry::new()),
            functions: Arc::new(FunctionRegistry::new()),
            memory: None,
            tools: None,
            recorder: None,
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    #[must_use]
    pub fn with_memory(mut self, memory: Arc<MemoryCoordinator>) -> Self {
        self.memory = Some(memory);
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Parse and start a workflow from DSL text.
    pub async fn start_from_dsl(
        &self,
        dsl: &str,
        inputs: VarMap,
        options: RunOptions,
    ) -> Result<RunningWorkflow, RunnerError> {
        let config = GraphConfig::from_json(dsl)?;
        self.start(&config, inputs, options).await
    }

    /// Build the graph, assert conversation ownership, and start the
    /// engine. The returned stream must be drained to completion.
    #[instrument(skip_all, err)]
    pub async fn start(
        &self,
        config: &GraphConfig,
        inputs: VarMap,
        options: RunOptions,
    ) -> Result<RunningWorkflow, RunnerError> {
        let graph = Arc::new(Graph::init(config, &self.registry)?);

        // Ownership is asserted before the engine or any memory write
        // can touch the conversation.
        if let (Some(scope), Some(conversation_id), Some(recorder)) =
            (&options.scope, &options.conversation_id, &self.recorder)
        {
            recorder
                .repository()
                .ensure_conversation_ownership(conversation_id, scope)
                .await?;
        }

        let inputs_json = serde_json::to_value(&inputs)?;
        let pool = Arc::new(VariablePool::with_inputs(inputs));
        let runtime_state = Arc::new(GraphRuntimeState::new(pool.clone()));

        let mut ctx = ExecutionContext::new(pool)
            .with_providers(self.providers.clone())
            .with_functions(self.functions.clone());
        if let Some(memory) = &self.memory {
            ctx = ctx.with_memory(memory.clone());
        }
        if let Some(conversation_id) = &options.conversation_id {
            ctx = ctx.with_conversation_id(conversation_id);
        }
        if let Some(tools) = &self.tools {
            ctx = ctx.with_tools(tools.clone());
        }
        if let Some(scope) = &options.scope {
            ctx = ctx.with_scope(scope.clone());
        }
        if let Some(cancellation) = &options.cancellation {
            ctx = ctx.with_cancellation(cancellation.clone());
        }

        let mut run = WorkflowRun::started(
            options.workflow_id.clone().unwrap_or_default(),
            options.scope.as_ref(),
        );
        run.conversation_id = options.conversation_id.clone();
        run.inputs = Some(inputs_json);

        let engine = GraphEngine::new(graph, runtime_state.clone(), self.engine_config.clone());
        let events = engine.clone().run(ctx);

        Ok(RunningWorkflow {
            events,
            engine,
            run,
            runtime_state,
        })
    }

    /// Run to completion, fold the stream into a [`RunResult`], and
    /// dispatch persistence asynchronously so the caller's latency is
    /// unaffected.
    pub async fn run_sync(
        &self,
        config: &GraphConfig,
        inputs: VarMap,
        options: RunOptions,
    ) -> Result<RunResult, RunnerError> {
        let scope = options.scope.clone();
        let run_timeout = options.run_timeout.unwrap_or(DEFAULT_RUN_TIMEOUT);
        let workflow = self.start(config, inputs, options).await?;
        let RunningWorkflow {
            events,
            engine,
            mut run,
            runtime_state,
        } = workflow;

        let deadline = tokio::time::sleep(run_timeout);
        tokio::pin!(deadline);
        let mut terminal: Option<GraphEvent> = None;
        let mut timed_out = false;
        loop {
            if timed_out {
                // Deadline already fired: just drain until the aborted
                // terminal event arrives.
                match events.recv_async().await {
                    Ok(event) => {
                        if event.is_terminal() {
                            terminal = Some(event);
                        }
                    }
                    Err(_) => break,
                }
                continue;
            }
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(run_id = %run.id, "run timeout exceeded, aborting");
                    engine.abort();
                    timed_out = true;
                }
                event = events.recv_async() => match event {
                    Ok(event) => {
                        if event.is_terminal() {
                            terminal = Some(event);
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        let (status, outputs, error, node_executions) = match terminal {
            Some(event) => {
                let status = match event.kind {
                    EventKind::GraphRunSucceeded => RunStatus::Succeeded,
                    EventKind::GraphRunAborted => RunStatus::Aborted,
                    _ => RunStatus::Failed,
                };
                (
                    status,
                    event.outputs.unwrap_or_default(),
                    event.error,
                    event.node_executions.unwrap_or_default(),
                )
            }
            None => (
                RunStatus::Failed,
                VarMap::default(),
                Some("event stream ended without a terminal event".to_string()),
                Vec::new(),
            ),
        };

        let finished_at = Utc::now();
        run.status = status;
        run.outputs = Some(serde_json::to_value(&outputs)?);
        run.error = error.clone();
        run.total_tokens = runtime_state.total_tokens();
        run.total_steps = runtime_state.node_run_steps();
        run.elapsed_ms = (finished_at - run.started_at).num_milliseconds().max(0) as u64;
        run.finished_at = Some(finished_at);

        if let Some(recorder) = &self.recorder {
            let recorder = recorder.clone();
            let run = run.clone();
            let executions = node_executions.clone();
            tokio::spawn(async move {
                if let Err(err) = recorder.record(scope.as_ref(), &run, &executions).await {
                    tracing::error!(run_id = %run.id, error = %err, "failed to persist run");
                }
            });
        }

        Ok(RunResult {
            run_id: run.id,
            status,
            outputs,
            error,
            node_executions,
        })
    }
}
