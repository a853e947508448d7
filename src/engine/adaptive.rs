//! Memory-driven batch sizing with out-of-memory recovery.

use candle_core::Device;

use super::buffer::LayerOutputs;
use super::strategy::{layer_progress, ComputeStrategy, ExecOptions, LayerContext};
use super::tuner::{AutoTuner, Budget};
use crate::sampling::{BatchDataSource, FullNeighborSampler};
use crate::utils::format_bytes;

/// Sizes every batch from the previous one's memory peak.
///
/// Each layer starts from the initial budget. A batch that exhausts memory
/// is pushed back to the data source and retried with half the size; the
/// layer only fails when a single node does not fit.
pub struct AdaptiveStrategy {
    device: Device,
    initial: Budget,
    target_fraction: f64,
    options: ExecOptions,
    max_memory: usize,
    failures: usize,
}

impl AdaptiveStrategy {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            initial: Budget::new(1000, 10000),
            target_fraction: 0.8,
            options: ExecOptions::default(),
            max_memory: 0,
            failures: 0,
        }
    }

    pub fn with_initial_budget(mut self, max_node: usize, max_edge: usize) -> Self {
        self.initial = Budget::new(max_node.max(1), max_edge.max(1));
        self
    }

    pub fn with_target_fraction(mut self, fraction: f64) -> Self {
        self.target_fraction = fraction;
        self
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    /// Highest batch peak of the current or last inference call, in bytes
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Batches retried after exhausting memory during the last call
    pub fn failures(&self) -> usize {
        self.failures
    }
}

impl ComputeStrategy for AdaptiveStrategy {
    fn compute(
        &mut self,
        cx: LayerContext<'_>,
        mut outputs: LayerOutputs,
    ) -> crate::Result<LayerOutputs> {
        let num_nodes = cx.num_nodes();
        let mut tuner = AutoTuner::new(self.initial, cx.memory.target_bytes(self.target_fraction));
        let mut source = BatchDataSource::new(
            cx.graph.clone(),
            FullNeighborSampler::default(),
            0..num_nodes as u32,
        )
        .with_budget(self.initial.max_node, self.initial.max_edge);

        let _staging = self
            .options
            .pin_inputs
            .then(|| cx.memory.pin(cx.staging_bytes(self.initial.max_node)));
        let pb = layer_progress(cx.layer.id, num_nodes, self.options.progress);

        loop {
            cx.memory.reset_peak();
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let claimed = Budget::new(batch.output_nodes.len(), batch.num_edges());

            let budget = match cx.execute_batch(&batch, &mut outputs, &self.device) {
                Ok(sample) => {
                    self.max_memory = self.max_memory.max(sample.peak_bytes);
                    pb.inc(sample.nodes as u64);
                    tuner.propose_next(sample)
                }
                Err(e) if e.is_resource_exhaustion() => {
                    tracing::warn!(
                        "Layer {}: batch of {} nodes / {} edges exhausted memory, retrying smaller: {}",
                        cx.layer.id,
                        claimed.max_node,
                        claimed.max_edge,
                        e
                    );
                    self.failures += 1;
                    let budget = tuner.shrink_after_failure(claimed)?;
                    drop(batch);
                    source.requeue(claimed.max_node)?;
                    cx.memory.clear_caches();
                    budget
                }
                Err(e) => return Err(e),
            };
            source.set_max_node(budget.max_node);
            source.set_max_edge(budget.max_edge);
        }
        pb.finish_and_clear();

        tracing::info!(
            "Layer {} done: {} samples, {} retries, peak {}",
            cx.layer.id,
            tuner.history().len(),
            tuner.failures(),
            format_bytes(self.max_memory as u64)
        );
        Ok(outputs)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn before_inference(&mut self, _graph: &crate::CsrGraph, _args: &[crate::Value]) -> crate::Result<()> {
        self.max_memory = 0;
        self.failures = 0;
        Ok(())
    }

    fn after_inference(&mut self) {
        tracing::info!("Maximum memory: {}", format_bytes(self.max_memory as u64));
    }
}
