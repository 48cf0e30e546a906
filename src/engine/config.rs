//! Engine configuration.

use std::time::Duration;

/// Tunables of a graph execution.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Size of the worker pool.
    pub max_workers: usize,
    /// Deadline for a single node execution.
    pub node_timeout: Duration,
    /// Global cap on node executions per run.
    pub max_node_steps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: 4,
            node_timeout: Duration::from_secs(300),
            max_node_steps: 100,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    #[must_use]
    pub fn with_node_timeout(mut self, node_timeout: Duration) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    #[must_use]
    pub fn with_max_node_steps(mut self, max_node_steps: u32) -> Self {
        self.max_node_steps = max_node_steps;
        self
    }
}
