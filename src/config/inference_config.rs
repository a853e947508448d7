//! Settings for driving layer-wise inference.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// How each layer pass splits the node set into batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Fixed number of nodes per batch
    Fixed,
    /// Nodes until an in-edge budget is reached
    Edge,
    /// Budget tuned from observed memory, shrinking on exhaustion
    #[default]
    Auto,
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::LayerwiseError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(StrategyKind::Fixed),
            "edge" => Ok(StrategyKind::Edge),
            "auto" | "adaptive" => Ok(StrategyKind::Auto),
            other => Err(crate::LayerwiseError::ConfigError(format!(
                "unknown strategy '{}', expected fixed, edge or auto",
                other
            ))),
        }
    }
}

/// Inference configuration, loadable from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Nodes per batch for the fixed strategy
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// In-edges per batch for the edge strategy
    #[serde(default = "default_max_edges_per_batch")]
    pub max_edges_per_batch: usize,

    /// Starting node budget of the adaptive strategy
    #[serde(default = "default_initial_max_node")]
    pub initial_max_node: usize,

    /// Starting edge budget of the adaptive strategy
    #[serde(default = "default_initial_max_edge")]
    pub initial_max_edge: usize,

    /// Share of device capacity the adaptive strategy aims for
    #[serde(default = "default_target_memory_fraction")]
    pub target_memory_fraction: f64,

    /// Memory capacity to account against (system memory when unset)
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,

    /// Background sampling threads (0 samples inline)
    #[serde(default)]
    pub num_workers: usize,

    /// Batches kept ready by the prefetcher
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,

    /// Stage batch inputs in pinned host memory
    #[serde(default)]
    pub pin_inputs: bool,

    /// Show per-layer progress bars
    #[serde(default = "default_progress")]
    pub progress: bool,
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_edges_per_batch() -> usize {
    100_000
}

fn default_initial_max_node() -> usize {
    1000
}

fn default_initial_max_edge() -> usize {
    10000
}

fn default_target_memory_fraction() -> f64 {
    0.8
}

fn default_prefetch_depth() -> usize {
    2
}

fn default_progress() -> bool {
    true
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            batch_size: default_batch_size(),
            max_edges_per_batch: default_max_edges_per_batch(),
            initial_max_node: default_initial_max_node(),
            initial_max_edge: default_initial_max_edge(),
            target_memory_fraction: default_target_memory_fraction(),
            memory_limit_bytes: None,
            num_workers: 0,
            prefetch_depth: default_prefetch_depth(),
            pin_inputs: false,
            progress: default_progress(),
        }
    }
}

impl InferenceConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: InferenceConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: &str| Err(crate::LayerwiseError::ConfigError(msg.to_string()));
        if self.batch_size == 0 {
            return fail("batch_size must be positive");
        }
        if self.max_edges_per_batch == 0 {
            return fail("max_edges_per_batch must be positive");
        }
        if self.initial_max_node == 0 || self.initial_max_edge == 0 {
            return fail("initial budgets must be positive");
        }
        if !(self.target_memory_fraction > 0.0 && self.target_memory_fraction <= 1.0) {
            return fail("target_memory_fraction must be in (0, 1]");
        }
        if self.memory_limit_bytes == Some(0) {
            return fail("memory_limit_bytes must be positive");
        }
        Ok(())
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_edges(mut self, max_edges: usize) -> Self {
        self.max_edges_per_batch = max_edges;
        self
    }

    pub fn with_initial_budget(mut self, max_node: usize, max_edge: usize) -> Self {
        self.initial_max_node = max_node;
        self.initial_max_edge = max_edge;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}
