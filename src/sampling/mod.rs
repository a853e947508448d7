//! Graph storage, neighborhood sampling and batch production.
//!
//! This module provides:
//! - `CsrGraph`: the full input graph as in-edge CSR
//! - `Block` / `Batch`: local subgraphs handed to layer functions
//! - `NeighborSampler`: trait for building batches from seed nodes
//! - `BatchDataSource`: budgeted, requeueable batch producer
//! - `BatchPrefetcher`: background sampling for fixed budgets

mod block;
mod graph;
mod prefetch;
mod sampler;
mod source;

pub use block::{Batch, Block, Reduce};
pub use graph::CsrGraph;
pub use prefetch::BatchPrefetcher;
pub use sampler::{FullNeighborSampler, NeighborSampler};
pub use source::BatchDataSource;
