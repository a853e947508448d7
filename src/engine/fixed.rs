//! Constant node count per batch.

use candle_core::Device;

use super::buffer::LayerOutputs;
use super::strategy::{run_static, ComputeStrategy, ExecOptions, LayerContext};

pub struct FixedBatchStrategy {
    batch_size: usize,
    device: Device,
    options: ExecOptions,
}

impl FixedBatchStrategy {
    pub fn new(batch_size: usize, device: Device) -> Self {
        Self {
            batch_size: batch_size.max(1),
            device,
            options: ExecOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl ComputeStrategy for FixedBatchStrategy {
    fn compute(
        &mut self,
        cx: LayerContext<'_>,
        outputs: LayerOutputs,
    ) -> crate::Result<LayerOutputs> {
        run_static(
            &cx,
            outputs,
            self.batch_size,
            usize::MAX,
            &self.device,
            &self.options,
        )
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
