//! Configuration for inference runs.

mod inference_config;

pub use inference_config::{InferenceConfig, StrategyKind};
