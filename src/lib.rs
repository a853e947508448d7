//! # rs-layerwise
//!
//! Memory-bounded, layer-wise inference for message-passing models over
//! graphs too large to push through the whole model in one pass.
//!
//! ## Core Concept
//!
//! A multi-layer graph model normally runs every layer on one neighborhood
//! sample per target node. For full-graph inference that sample explodes, so
//! instead we:
//! - **Split the model**: trace its forward pass once and cut it into one
//!   independent function per layer, tracking which values cross layers
//! - **Run layer by layer**: compute layer `l` for every node before starting
//!   layer `l + 1`, keeping only the intermediate buffers still needed
//! - **Batch adaptively**: size node batches from observed memory use and
//!   shrink-and-retry on out-of-memory instead of aborting
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rs_layerwise::{CsrGraph, GraphSage, InferenceHelper, Value};
//! use rs_layerwise::engine::FixedBatchStrategy;
//!
//! let graph = Arc::new(CsrGraph::from_edges(5, &[(0, 1), (1, 2)])?);
//! let model = GraphSage::new(&[16, 32, 8], &candle_core::Device::Cpu)?;
//! let strategy = FixedBatchStrategy::new(1024, candle_core::Device::Cpu);
//! let mut helper = InferenceHelper::new(&model, strategy)?;
//! let out = helper.inference(&graph, vec![Value::Tensor(features)])?;
//! ```

pub mod compiler;
pub mod config;
pub mod engine;
pub mod ir;
pub mod model;
pub mod sampling;
pub mod trace;
pub mod utils;

// Re-exports for convenience
pub use compiler::{FunctionGenerator, LayerFn, Schema};
pub use config::{InferenceConfig, StrategyKind};
pub use engine::{AutoTuner, ComputeStrategy, InferenceHelper, Strategy};
pub use ir::{Graph, Value};
pub use model::{Component, ComponentRegistry, GraphSage, Traceable};
pub use sampling::{Batch, BatchDataSource, Block, CsrGraph, FullNeighborSampler};
pub use trace::SymbolicTracer;
pub use utils::{get_device, Device, DType, HostMemory};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum LayerwiseError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Argument count mismatch: model expects {expected} inputs, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Layer {layer} produced {actual} outputs but its schema declares {expected}")]
    OutputArityMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("No per-layer block selections found; route each layer through `GetBlock`")]
    NoLayerBoundaries,

    #[error("Unresolved component: {0}")]
    UnresolvedComponent(String),

    #[error("Graph error: {0}")]
    GraphError(String),

    #[error("Evaluation error: {0}")]
    EvalError(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Sampling error: {0}")]
    SamplingError(String),

    #[error("Coverage error: {0}")]
    CoverageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl LayerwiseError {
    /// Whether the error reports the device running out of memory.
    ///
    /// Backend allocation failures surface as candle errors, so their
    /// messages are inspected as well.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            LayerwiseError::ResourceExhausted(_) => true,
            LayerwiseError::CandleError(e) => {
                let msg = e.to_string().to_lowercase();
                msg.contains("out of memory") || msg.contains("out_of_memory")
            }
            _ => false,
        }
    }

    /// Whether the error is an unrecoverable configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LayerwiseError::ConfigError(_)
                | LayerwiseError::ArityMismatch { .. }
                | LayerwiseError::OutputArityMismatch { .. }
                | LayerwiseError::NoLayerBoundaries
                | LayerwiseError::UnresolvedComponent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LayerwiseError>;
