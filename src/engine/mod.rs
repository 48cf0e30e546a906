//! The graph execution engine.

pub mod config;
pub mod runtime_state;
pub mod scheduler;

pub use config::EngineConfig;
pub use runtime_state::{GraphExecution, GraphRuntimeState};
pub use scheduler::GraphEngine;
