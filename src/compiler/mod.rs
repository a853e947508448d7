//! Layer splitting: turns one traced forward pass into per-layer functions.
//!
//! This module provides:
//! - `rewriter`: block-selection normalization and dead node pruning
//! - `GraphReplicator`: copies nodes into a fresh graph by name
//! - `GraphRearranger`: assigns nodes to layers and builds the layer graphs
//! - `Schema`: which layer produces and consumes each cross-layer value
//! - `LayerFunction`: interprets a layer graph with candle
//! - `FunctionGenerator`: runs the whole pipeline

mod function;
mod generator;
mod rearranger;
mod replicator;
pub mod rewriter;
mod schema;

pub use function::{LayerFn, LayerFunction};
pub use generator::FunctionGenerator;
pub use rearranger::GraphRearranger;
pub use replicator::GraphReplicator;
pub use schema::{ArgId, ArgNode, Layer, Schema};
