//! Neighborhood samplers turning seed nodes into batches.

use std::sync::Arc;

use super::block::{Batch, Block};
use super::graph::CsrGraph;

/// Builds the local subgraphs needed to compute a set of seed nodes.
pub trait NeighborSampler: Send + Sync {
    /// Sample the neighborhood of `seeds`; the batch's output nodes must be
    /// exactly `seeds`, in order.
    fn sample(&self, graph: &CsrGraph, seeds: &[u32]) -> crate::Result<Batch>;
}

/// Takes every in-neighbor, hop after hop.
#[derive(Debug, Clone)]
pub struct FullNeighborSampler {
    num_hops: usize,
}

impl FullNeighborSampler {
    pub fn new(num_hops: usize) -> Self {
        Self {
            num_hops: num_hops.max(1),
        }
    }

    pub fn num_hops(&self) -> usize {
        self.num_hops
    }
}

impl Default for FullNeighborSampler {
    /// Layer-wise inference only ever needs one hop per layer
    fn default() -> Self {
        Self::new(1)
    }
}

impl NeighborSampler for FullNeighborSampler {
    fn sample(&self, graph: &CsrGraph, seeds: &[u32]) -> crate::Result<Batch> {
        let mut blocks = Vec::with_capacity(self.num_hops);
        let mut frontier = seeds.to_vec();
        for _ in 0..self.num_hops {
            let block = Block::from_graph(graph, &frontier)?;
            frontier = block.src_nodes().to_vec();
            blocks.push(Arc::new(block));
        }
        // Outermost hop first
        blocks.reverse();

        Ok(Batch {
            input_nodes: frontier,
            output_nodes: seeds.to_vec(),
            blocks,
        })
    }
}
