//! Batched layer-by-layer execution
//!
//! [`InferenceHelper`] drives a split model over a whole graph. How each
//! layer pass is cut into batches is up to a [`ComputeStrategy`]: a fixed
//! node count, an edge budget, or the memory-driven [`AdaptiveStrategy`].

mod adaptive;
mod buffer;
mod edge;
mod fixed;
mod helper;
mod strategy;
mod tuner;

pub use adaptive::AdaptiveStrategy;
pub use buffer::{LayerOutputs, OutputSpec};
pub use edge::EdgeBudgetStrategy;
pub use fixed::FixedBatchStrategy;
pub use helper::InferenceHelper;
pub use strategy::{ComputeStrategy, ExecOptions, LayerContext, Strategy};
pub use tuner::{AutoTuner, BatchSample, Budget};
