//! Batches bounded by their total in-edge count.

use candle_core::Device;

use super::buffer::LayerOutputs;
use super::strategy::{run_static, ComputeStrategy, ExecOptions, LayerContext};

/// Adds nodes to a batch until their summed in-degree would pass
/// `max_edges`. A single node above the limit still forms its own batch.
pub struct EdgeBudgetStrategy {
    max_edges: usize,
    device: Device,
    options: ExecOptions,
}

impl EdgeBudgetStrategy {
    pub fn new(max_edges: usize, device: Device) -> Self {
        Self {
            max_edges: max_edges.max(1),
            device,
            options: ExecOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_edges(&self) -> usize {
        self.max_edges
    }
}

impl ComputeStrategy for EdgeBudgetStrategy {
    fn compute(
        &mut self,
        cx: LayerContext<'_>,
        outputs: LayerOutputs,
    ) -> crate::Result<LayerOutputs> {
        run_static(
            &cx,
            outputs,
            usize::MAX,
            self.max_edges,
            &self.device,
            &self.options,
        )
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
