//! Local-function registry for the function node.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::RwLock;

use crate::types::VarMap;

/// Boxed error returned by function implementations; mapped to the
/// `exec-failed` / `exec-timeout` codes by the node.
pub type FunctionError = Box<dyn std::error::Error + Send + Sync>;

/// A callable local function bound by `function_ref`.
#[async_trait]
pub trait LocalFunction: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, inputs: VarMap) -> Result<VarMap, FunctionError>;
}

/// Name → function lookup table.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<FxHashMap<String, Arc<dyn LocalFunction>>>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    /// Register a function. Re-registering the same name is rejected so
    /// a workflow cannot silently shadow a binding.
    pub fn register(&self, function: Arc<dyn LocalFunction>) -> Result<(), String> {
        let name = function.name().to_string();
        if name.is_empty() {
            return Err("function name is empty".to_string());
        }
        let mut functions = self.functions.write().expect("function registry poisoned");
        if functions.contains_key(&name) {
            return Err(format!("function already registered: {name}"));
        }
        functions.insert(name, function);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn LocalFunction>> {
        self.functions
            .read()
            .expect("function registry poisoned")
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.functions
            .read()
            .expect("function registry poisoned")
            .contains_key(name)
    }
}
