//! The ambient execution context handed to nodes.
//!
//! Everything the scheduler injects for node execution travels here: the
//! variable pool, the optional memory coordinator and conversation id,
//! the tool/function/provider registries, the tenant scope, and the
//! cancellation signal. Cloning is cheap (Arc handles all the way down).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::memory::MemoryCoordinator;
use crate::nodes::function::FunctionRegistry;
use crate::provider::ProviderRegistry;
use crate::tool::ToolRegistry;
use crate::types::TenantScope;
use crate::vars::VariablePool;

/// Per-run ambient context.
#[derive(Clone)]
pub struct ExecutionContext {
    pub variable_pool: Arc<VariablePool>,
    pub providers: Arc<ProviderRegistry>,
    pub functions: Arc<FunctionRegistry>,
    pub memory: Option<Arc<MemoryCoordinator>>,
    pub conversation_id: Option<String>,
    pub tools: Option<Arc<ToolRegistry>>,
    pub scope: Option<TenantScope>,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    /// A context with only the variable pool populated. Registries start
    /// empty; optional collaborators start absent.
    #[must_use]
    pub fn new(variable_pool: Arc<VariablePool>) -> Self {
        ExecutionContext {
            variable_pool,
            providers: Arc::new(ProviderRegistry::new()),
            functions: Arc::new(FunctionRegistry::new()),
            memory: None,
            conversation_id: None,
            tools: None,
            scope: None,
            cancellation: CancellationToken::new(),
        }
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
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: TenantScope) -> Self {
        self.scope = Some(scope);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// A detached context for background work (async memory writes,
    /// off-hot-path persistence): same collaborators and tenant scope,
    /// fresh cancellation so the originating request's abort does not
    /// tear the background task down.
    #[must_use]
    pub fn background(&self) -> Self {
        let mut ctx = self.clone();
        ctx.cancellation = CancellationToken::new();
        ctx
    }
}
