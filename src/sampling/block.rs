//! Local subgraphs ("blocks") and the batches that carry them.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::graph::CsrGraph;

/// Neighbor reduction used by [`Block::aggregate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Sum,
    Mean,
}

/// Bipartite local subgraph for one batch.
///
/// Destination nodes are the batch's targets; source nodes are the
/// destinations followed by their extra in-neighbors, so the first
/// `num_dst_nodes` sources are the destinations themselves. Edges use local
/// indices: `edge_src` into sources, `edge_dst` into destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    src_nodes: Vec<u32>,
    num_dst: usize,
    edge_src: Vec<u32>,
    edge_dst: Vec<u32>,
}

impl Block {
    pub fn new(
        src_nodes: Vec<u32>,
        num_dst: usize,
        edge_src: Vec<u32>,
        edge_dst: Vec<u32>,
    ) -> crate::Result<Self> {
        let block = Self {
            src_nodes,
            num_dst,
            edge_src,
            edge_dst,
        };
        block.validate()?;
        Ok(block)
    }

    /// One-hop in-neighborhood of `seeds`
    pub fn from_graph(graph: &CsrGraph, seeds: &[u32]) -> crate::Result<Self> {
        let mut src_nodes = seeds.to_vec();
        let mut local: HashMap<u32, u32> = HashMap::with_capacity(seeds.len());
        for (i, &node) in seeds.iter().enumerate() {
            if node as usize >= graph.num_nodes() {
                return Err(crate::LayerwiseError::SamplingError(format!(
                    "seed {} out of range for {} nodes",
                    node,
                    graph.num_nodes()
                )));
            }
            if local.insert(node, i as u32).is_some() {
                return Err(crate::LayerwiseError::SamplingError(format!(
                    "seed {} appears twice in one batch",
                    node
                )));
            }
        }

        let mut edge_src = Vec::new();
        let mut edge_dst = Vec::new();
        for (dst_local, &dst) in seeds.iter().enumerate() {
            for &src in graph.in_neighbors(dst) {
                let src_local = *local.entry(src).or_insert_with(|| {
                    src_nodes.push(src);
                    (src_nodes.len() - 1) as u32
                });
                edge_src.push(src_local);
                edge_dst.push(dst_local as u32);
            }
        }

        Self::new(src_nodes, seeds.len(), edge_src, edge_dst)
    }

    /// Minimal block: a single node with one self-loop
    pub fn single_edge() -> Self {
        Self {
            src_nodes: vec![0],
            num_dst: 1,
            edge_src: vec![0],
            edge_dst: vec![0],
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: String| Err(crate::LayerwiseError::SamplingError(msg));
        if self.num_dst > self.src_nodes.len() {
            return fail(format!(
                "block has {} destinations but only {} sources",
                self.num_dst,
                self.src_nodes.len()
            ));
        }
        if self.edge_src.len() != self.edge_dst.len() {
            return fail("edge endpoint arrays differ in length".to_string());
        }
        if let Some(&bad) = self.edge_src.iter().find(|&&s| s as usize >= self.src_nodes.len()) {
            return fail(format!("edge source {} out of range", bad));
        }
        if let Some(&bad) = self.edge_dst.iter().find(|&&d| d as usize >= self.num_dst) {
            return fail(format!("edge destination {} out of range", bad));
        }
        Ok(())
    }

    pub fn num_src_nodes(&self) -> usize {
        self.src_nodes.len()
    }

    pub fn num_dst_nodes(&self) -> usize {
        self.num_dst
    }

    pub fn num_edges(&self) -> usize {
        self.edge_src.len()
    }

    /// Global ids of the source nodes
    pub fn src_nodes(&self) -> &[u32] {
        &self.src_nodes
    }

    /// Global ids of the destination nodes (prefix of the sources)
    pub fn dst_nodes(&self) -> &[u32] {
        &self.src_nodes[..self.num_dst]
    }

    pub fn edge_src(&self) -> &[u32] {
        &self.edge_src
    }

    pub fn edge_dst(&self) -> &[u32] {
        &self.edge_dst
    }

    /// Local edge endpoints as `u32` tensors on `device`
    pub fn edge_index(&self, device: &Device) -> crate::Result<(Tensor, Tensor)> {
        let src = Tensor::from_slice(&self.edge_src, self.edge_src.len(), device)?;
        let dst = Tensor::from_slice(&self.edge_dst, self.edge_dst.len(), device)?;
        Ok((src, dst))
    }

    /// Reduce source-node features over each destination's in-edges.
    ///
    /// `src_feats` has one row per source node; the result has one row per
    /// destination. Destinations without in-edges get zeros.
    pub fn aggregate(&self, src_feats: &Tensor, reduce: Reduce) -> crate::Result<Tensor> {
        let dims = src_feats.dims();
        if dims.first() != Some(&self.num_src_nodes()) {
            return Err(crate::LayerwiseError::EvalError(format!(
                "aggregate expects {} source rows, got shape {:?}",
                self.num_src_nodes(),
                dims
            )));
        }

        let mut out_dims = dims.to_vec();
        out_dims[0] = self.num_dst;
        let out = Tensor::zeros(out_dims.as_slice(), src_feats.dtype(), src_feats.device())?;
        if self.edge_src.is_empty() {
            return Ok(out);
        }

        let (src_idx, dst_idx) = self.edge_index(src_feats.device())?;
        let messages = src_feats.index_select(&src_idx, 0)?;
        let summed = out.index_add(&dst_idx, &messages, 0)?;

        match reduce {
            Reduce::Sum => Ok(summed),
            Reduce::Mean => {
                let mut degree = vec![0f32; self.num_dst];
                for &d in &self.edge_dst {
                    degree[d as usize] += 1.0;
                }
                for d in degree.iter_mut() {
                    *d = d.max(1.0);
                }
                let mut deg_dims = vec![1usize; out_dims.len()];
                deg_dims[0] = self.num_dst;
                let degree = Tensor::from_vec(degree, deg_dims.as_slice(), src_feats.device())?
                    .to_dtype(src_feats.dtype())?;
                Ok(summed.broadcast_div(&degree)?)
            }
        }
    }
}

/// One unit of work: the nodes to read, the nodes to produce, and the local
/// subgraphs connecting them (outermost hop first).
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_nodes: Vec<u32>,
    pub output_nodes: Vec<u32>,
    pub blocks: Vec<Arc<Block>>,
}

impl Batch {
    /// Single-hop batch around one block
    pub fn from_block(block: Block) -> Self {
        Self {
            input_nodes: block.src_nodes().to_vec(),
            output_nodes: block.dst_nodes().to_vec(),
            blocks: vec![Arc::new(block)],
        }
    }

    /// One-node synthetic batch used to probe output shapes
    pub fn probe() -> Self {
        Self::from_block(Block::single_edge())
    }

    /// The block a layer function consumes
    pub fn block(&self) -> crate::Result<&Arc<Block>> {
        self.blocks
            .first()
            .ok_or_else(|| crate::LayerwiseError::SamplingError("batch has no blocks".to_string()))
    }

    pub fn num_edges(&self) -> usize {
        self.blocks.first().map_or(0, |b| b.num_edges())
    }

    /// Check the structural contract every sampler must honour
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: &str| Err(crate::LayerwiseError::SamplingError(msg.to_string()));
        let (first, last) = match (self.blocks.first(), self.blocks.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return fail("batch has no blocks"),
        };
        if self.output_nodes.is_empty() {
            return fail("batch has no output nodes");
        }
        if first.src_nodes() != self.input_nodes.as_slice() {
            return fail("input nodes differ from the outer block's sources");
        }
        if last.dst_nodes() != self.output_nodes.as_slice() {
            return fail("output nodes differ from the inner block's destinations");
        }
        for pair in self.blocks.windows(2) {
            if pair[0].dst_nodes() != pair[1].src_nodes() {
                return fail("consecutive blocks do not chain");
            }
        }
        for block in &self.blocks {
            block.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn chain() -> CsrGraph {
        CsrGraph::from_edges(5, &[(0, 1), (1, 2), (2, 3), (3, 4)]).unwrap()
    }

    #[test]
    fn test_from_graph_layout() {
        let block = Block::from_graph(&chain(), &[2, 3]).unwrap();
        assert_eq!(block.dst_nodes(), &[2, 3]);
        assert_eq!(block.src_nodes(), &[2, 3, 1]);
        assert_eq!(block.num_edges(), 2);
        assert_eq!(block.edge_src(), &[2, 0]);
        assert_eq!(block.edge_dst(), &[0, 1]);
    }

    #[test]
    fn test_duplicate_seed_rejected() {
        let err = Block::from_graph(&chain(), &[1, 1]).unwrap_err();
        assert!(matches!(err, crate::LayerwiseError::SamplingError(_)));
    }

    #[test]
    fn test_aggregate_sum_and_mean() {
        let g = CsrGraph::from_edges(3, &[(1, 0), (2, 0)]).unwrap();
        let block = Block::from_graph(&g, &[0]).unwrap();
        let feats = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), &Device::Cpu)
            .unwrap();

        let sum: Vec<Vec<f32>> = block.aggregate(&feats, Reduce::Sum).unwrap().to_vec2().unwrap();
        assert_eq!(sum, vec![vec![8.0, 10.0]]);

        let mean: Vec<Vec<f32>> = block.aggregate(&feats, Reduce::Mean).unwrap().to_vec2().unwrap();
        assert_eq!(mean, vec![vec![4.0, 5.0]]);
    }

    #[test]
    fn test_aggregate_without_edges() {
        let g = CsrGraph::from_edges(2, &[]).unwrap();
        let block = Block::from_graph(&g, &[0, 1]).unwrap();
        let feats = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = block.aggregate(&feats, Reduce::Mean).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![0.0; 3]; 2]);
    }

    #[test]
    fn test_batch_validate() {
        let block = Block::from_graph(&chain(), &[1, 2]).unwrap();
        let mut batch = Batch::from_block(block);
        assert!(batch.validate().is_ok());

        batch.output_nodes = vec![2, 1];
        assert!(batch.validate().is_err());

        let empty = Batch {
            input_nodes: vec![],
            output_nodes: vec![],
            blocks: vec![],
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_malformed_block_rejected() {
        assert!(Block::new(vec![0], 1, vec![3], vec![0]).is_err());
        assert!(Block::new(vec![0], 2, vec![], vec![]).is_err());
    }
}
