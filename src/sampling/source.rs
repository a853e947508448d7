//! Budgeted batch source over a pending queue of node ids.

use std::collections::VecDeque;
use std::sync::Arc;

use super::block::Batch;
use super::graph::CsrGraph;
use super::sampler::{FullNeighborSampler, NeighborSampler};

/// Hands out batches of pending node ids sized by a mutable
/// `(max_node, max_edge)` budget.
///
/// A batch takes ids from the front of the queue while both the node count
/// and the summed in-degree stay within budget, and always takes at least
/// one id. Failed batches can be pushed back with [`BatchDataSource::requeue`].
pub struct BatchDataSource<S: NeighborSampler = FullNeighborSampler> {
    graph: Arc<CsrGraph>,
    sampler: S,
    queue: VecDeque<u32>,
    last_claimed: Vec<u32>,
    max_node: usize,
    max_edge: usize,
}

impl<S: NeighborSampler> BatchDataSource<S> {
    /// Source over `ids` with an unbounded budget
    pub fn new(graph: Arc<CsrGraph>, sampler: S, ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            graph,
            sampler,
            queue: ids.into_iter().collect(),
            last_claimed: Vec::new(),
            max_node: usize::MAX,
            max_edge: usize::MAX,
        }
    }

    pub fn with_budget(mut self, max_node: usize, max_edge: usize) -> Self {
        self.set_max_node(max_node);
        self.set_max_edge(max_edge);
        self
    }

    /// Takes effect from the next batch on
    pub fn set_max_node(&mut self, max_node: usize) {
        self.max_node = max_node.max(1);
    }

    pub fn set_max_edge(&mut self, max_edge: usize) {
        self.max_edge = max_edge.max(1);
    }

    pub fn max_node(&self) -> usize {
        self.max_node
    }

    pub fn max_edge(&self) -> usize {
        self.max_edge
    }

    pub fn graph(&self) -> &Arc<CsrGraph> {
        &self.graph
    }

    /// Ids not yet handed out
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Ids claimed by the most recent batch
    pub fn last_claimed(&self) -> &[u32] {
        &self.last_claimed
    }

    /// Claim the next ids and sample their batch; `None` once drained.
    pub fn next_batch(&mut self) -> crate::Result<Option<Batch>> {
        let mut seeds = Vec::new();
        let mut edges = 0usize;
        while let Some(&id) = self.queue.front() {
            if id as usize >= self.graph.num_nodes() {
                // Ship what was claimed so far; the bad id fails on its own
                if !seeds.is_empty() {
                    break;
                }
                return Err(crate::LayerwiseError::SamplingError(format!(
                    "node id {} out of range for {} nodes",
                    id,
                    self.graph.num_nodes()
                )));
            }
            let degree = self.graph.in_degree(id);
            let fits = seeds.len() < self.max_node && edges.saturating_add(degree) <= self.max_edge;
            if !seeds.is_empty() && !fits {
                break;
            }
            edges = edges.saturating_add(degree);
            seeds.push(id);
            self.queue.pop_front();
        }

        if seeds.is_empty() {
            self.last_claimed.clear();
            return Ok(None);
        }

        let batch = match self.sample(&seeds) {
            Ok(batch) => batch,
            Err(e) => {
                for &id in seeds.iter().rev() {
                    self.queue.push_front(id);
                }
                self.last_claimed.clear();
                return Err(e);
            }
        };

        tracing::trace!(
            "Claimed {} nodes / {} edges ({} remaining)",
            seeds.len(),
            edges,
            self.queue.len()
        );
        self.last_claimed = seeds;
        Ok(Some(batch))
    }

    fn sample(&self, seeds: &[u32]) -> crate::Result<Batch> {
        let batch = self.sampler.sample(&self.graph, seeds)?;
        batch.validate()?;
        if batch.output_nodes != seeds {
            return Err(crate::LayerwiseError::SamplingError(
                "sampler returned output nodes other than the requested seeds".to_string(),
            ));
        }
        Ok(batch)
    }

    /// Return the last `n` claimed ids to the front of the queue, keeping
    /// their original order.
    pub fn requeue(&mut self, n: usize) -> crate::Result<()> {
        if n > self.last_claimed.len() {
            return Err(crate::LayerwiseError::SamplingError(format!(
                "cannot requeue {} ids, last batch claimed {}",
                n,
                self.last_claimed.len()
            )));
        }
        let split = self.last_claimed.len() - n;
        for id in self.last_claimed.drain(split..).rev() {
            self.queue.push_front(id);
        }
        Ok(())
    }
}

/// Static sources run to exhaustion as a plain iterator
impl<S: NeighborSampler> Iterator for BatchDataSource<S> {
    type Item = crate::Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn star() -> Arc<CsrGraph> {
        // node 0 has in-degree 3, the rest 0 or 1
        Arc::new(CsrGraph::from_edges(5, &[(1, 0), (2, 0), (3, 0), (0, 4)]).unwrap())
    }

    fn drain(source: &mut BatchDataSource) -> Vec<Vec<u32>> {
        let mut out = Vec::new();
        while let Some(batch) = source.next_batch().unwrap() {
            out.push(batch.output_nodes);
        }
        out
    }

    #[test]
    fn test_node_budget_partitions() {
        let mut source = BatchDataSource::new(star(), FullNeighborSampler::default(), 0..5)
            .with_budget(2, usize::MAX);
        let batches = drain(&mut source);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_edge_budget_takes_at_least_one() {
        let mut source = BatchDataSource::new(star(), FullNeighborSampler::default(), 0..5)
            .with_budget(usize::MAX, 1);
        let batches = drain(&mut source);
        // node 0 alone exceeds the edge budget but still makes progress
        assert_eq!(batches[0], vec![0]);
        let flat: Vec<u32> = batches.into_iter().flatten().collect();
        assert_eq!(flat, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_requeue_restores_order() {
        let mut source = BatchDataSource::new(star(), FullNeighborSampler::default(), 0..5)
            .with_budget(3, usize::MAX);
        let first = source.next_batch().unwrap().unwrap();
        assert_eq!(first.output_nodes, vec![0, 1, 2]);

        source.requeue(2).unwrap();
        source.set_max_node(10);
        let batches = drain(&mut source);
        assert_eq!(batches, vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_requeue_too_many() {
        let mut source = BatchDataSource::new(star(), FullNeighborSampler::default(), 0..5)
            .with_budget(1, usize::MAX);
        source.next_batch().unwrap();
        assert!(source.requeue(2).is_err());
        source.requeue(1).unwrap();
        assert_eq!(source.remaining(), 5);
    }

    #[test]
    fn test_out_of_range_id() {
        let mut source = BatchDataSource::new(star(), FullNeighborSampler::default(), vec![9]);
        assert!(source.next_batch().is_err());
    }
}
