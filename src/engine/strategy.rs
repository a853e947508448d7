//! Compute strategies: how one layer pass is cut into batches.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use super::adaptive::AdaptiveStrategy;
use super::buffer::LayerOutputs;
use super::edge::EdgeBudgetStrategy;
use super::fixed::FixedBatchStrategy;
use super::tuner::BatchSample;
use crate::compiler::{ArgId, Layer, LayerFn, Schema};
use crate::config::{InferenceConfig, StrategyKind};
use crate::ir::Value;
use crate::sampling::{Batch, BatchDataSource, BatchPrefetcher, CsrGraph, FullNeighborSampler};
use crate::utils::{to_device, MemoryContext};

/// Everything a strategy needs to run one layer over the whole graph
pub struct LayerContext<'a> {
    pub graph: &'a Arc<CsrGraph>,
    pub values: &'a HashMap<ArgId, Value>,
    pub schema: &'a Schema,
    pub layer: &'a Layer,
    pub func: &'a dyn LayerFn,
    pub memory: &'a MemoryContext,
}

impl LayerContext<'_> {
    pub fn num_nodes(&self) -> usize {
        self.graph.num_nodes()
    }

    /// Build the layer function's arguments for `batch`
    pub fn gather(&self, batch: &Batch, device: &Device) -> crate::Result<Vec<Value>> {
        gather_args(
            self.schema,
            self.layer,
            self.values,
            batch,
            self.num_nodes(),
            device,
        )
    }

    /// Run the layer on one batch and scatter its rows into `outputs`.
    ///
    /// Inputs and results are reserved against the memory context for the
    /// duration of the call, so an oversized batch fails with
    /// `ResourceExhausted` before touching the buffers.
    pub fn execute_batch(
        &self,
        batch: &Batch,
        outputs: &mut LayerOutputs,
        device: &Device,
    ) -> crate::Result<BatchSample> {
        let args = self.gather(batch, device)?;
        let input_bytes: usize = args.iter().map(Value::tensor_bytes).sum();
        let _inputs = self.memory.reserve(input_bytes)?;

        let result = self.func.call(&args)?;
        drop(args);
        let values = result.into_outputs();
        let output_bytes: usize = values.iter().map(Value::tensor_bytes).sum();
        let _outputs = self.memory.reserve(output_bytes)?;

        let block = batch.block()?;
        outputs.write(&batch.output_nodes, block.num_src_nodes(), values)?;

        Ok(BatchSample {
            nodes: batch.output_nodes.len(),
            edges: batch.num_edges(),
            peak_bytes: self.memory.peak(),
        })
    }

    /// Host bytes needed to stage `rows` rows of every row-indexed input
    pub fn staging_bytes(&self, rows: usize) -> usize {
        let rows = rows.min(self.num_nodes());
        self.layer
            .inputs
            .iter()
            .filter_map(|id| match self.values.get(id) {
                Some(Value::Tensor(t)) if t.rank() >= 1 && t.dims()[0] > 0 => {
                    Some(t.elem_count() / t.dims()[0] * t.dtype().size_in_bytes() * rows)
                }
                _ => None,
            })
            .sum()
    }
}

/// Select the arguments of `layer` for one batch.
///
/// Block inputs receive the batch's block. Tensors produced by earlier
/// layers, and model inputs with one row per graph node, are cut down to
/// the batch's input rows and moved to `device`. Anything else is passed
/// through unchanged.
pub(crate) fn gather_args(
    schema: &Schema,
    layer: &Layer,
    values: &HashMap<ArgId, Value>,
    batch: &Batch,
    num_nodes: usize,
    device: &Device,
) -> crate::Result<Vec<Value>> {
    layer
        .inputs
        .iter()
        .map(|&id| {
            let arg = schema.arg(id);
            if arg.is_block {
                return Ok(Value::Block(batch.block()?.clone()));
            }
            let value = values.get(&id).ok_or_else(|| {
                crate::LayerwiseError::EvalError(format!(
                    "layer {} input `{}` has no value",
                    layer.id, arg.name
                ))
            })?;
            match value {
                Value::Tensor(t)
                    if t.rank() >= 1
                        && (arg.output_layer.is_some() || t.dims()[0] == num_nodes) =>
                {
                    let index = Tensor::from_slice(
                        &batch.input_nodes,
                        batch.input_nodes.len(),
                        t.device(),
                    )?;
                    Ok(Value::Tensor(to_device(t.index_select(&index, 0)?, device)?))
                }
                other => Ok(other.clone()),
            }
        })
        .collect()
}

/// Knobs shared by every strategy
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub progress: bool,
    pub pin_inputs: bool,
    /// Sample on a background thread when non-zero
    pub num_workers: usize,
    pub prefetch_depth: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            progress: false,
            pin_inputs: false,
            num_workers: 0,
            prefetch_depth: 2,
        }
    }
}

impl From<&InferenceConfig> for ExecOptions {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            progress: config.progress,
            pin_inputs: config.pin_inputs,
            num_workers: config.num_workers,
            prefetch_depth: config.prefetch_depth,
        }
    }
}

/// Per-layer progress bar, hidden when progress is off
pub(crate) fn layer_progress(layer: usize, num_nodes: usize, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(num_nodes as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_message(format!("layer {}", layer));
    pb
}

/// Drive a layer pass with a budget that never changes
pub(crate) fn run_static(
    cx: &LayerContext<'_>,
    mut outputs: LayerOutputs,
    max_node: usize,
    max_edge: usize,
    device: &Device,
    options: &ExecOptions,
) -> crate::Result<LayerOutputs> {
    let num_nodes = cx.num_nodes();
    let source = BatchDataSource::new(
        cx.graph.clone(),
        FullNeighborSampler::default(),
        0..num_nodes as u32,
    )
    .with_budget(max_node, max_edge);

    let batches: Box<dyn Iterator<Item = crate::Result<Batch>>> = if options.num_workers > 0 {
        Box::new(BatchPrefetcher::spawn(source, options.prefetch_depth))
    } else {
        Box::new(source)
    };

    let _staging = options
        .pin_inputs
        .then(|| cx.memory.pin(cx.staging_bytes(max_node)));
    let pb = layer_progress(cx.layer.id, num_nodes, options.progress);

    let mut count = 0usize;
    for batch in batches {
        let batch = batch?;
        cx.execute_batch(&batch, &mut outputs, device)?;
        pb.inc(batch.output_nodes.len() as u64);
        count += 1;
    }
    pb.finish_and_clear();

    tracing::debug!("Layer {} ran in {} batches", cx.layer.id, count);
    Ok(outputs)
}

/// How the engine runs each layer over the graph
pub trait ComputeStrategy {
    /// Fill `outputs` for every node of the graph, each row exactly once
    fn compute(
        &mut self,
        cx: LayerContext<'_>,
        outputs: LayerOutputs,
    ) -> crate::Result<LayerOutputs>;

    /// Device layer inputs are moved to
    fn device(&self) -> &Device;

    /// Called before anything else in an inference call
    fn before_inference(&mut self, _graph: &CsrGraph, _args: &[Value]) -> crate::Result<()> {
        Ok(())
    }

    /// Called once the call is over, whether it succeeded or not
    fn after_inference(&mut self) {}
}

/// Strategy chosen at runtime from configuration
pub enum Strategy {
    Fixed(FixedBatchStrategy),
    Edge(EdgeBudgetStrategy),
    Adaptive(AdaptiveStrategy),
}

impl Strategy {
    pub fn from_config(config: &InferenceConfig, device: Device) -> crate::Result<Self> {
        config.validate()?;
        let options = ExecOptions::from(config);
        let strategy = match config.strategy {
            StrategyKind::Fixed => Strategy::Fixed(
                FixedBatchStrategy::new(config.batch_size, device).with_options(options),
            ),
            StrategyKind::Edge => Strategy::Edge(
                EdgeBudgetStrategy::new(config.max_edges_per_batch, device).with_options(options),
            ),
            StrategyKind::Auto => Strategy::Adaptive(
                AdaptiveStrategy::new(device)
                    .with_initial_budget(config.initial_max_node, config.initial_max_edge)
                    .with_target_fraction(config.target_memory_fraction)
                    .with_options(options),
            ),
        };
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Fixed(_) => StrategyKind::Fixed,
            Strategy::Edge(_) => StrategyKind::Edge,
            Strategy::Adaptive(_) => StrategyKind::Auto,
        }
    }

    /// Peak bytes seen by the adaptive strategy, if that is the one in use
    pub fn max_memory(&self) -> Option<usize> {
        match self {
            Strategy::Adaptive(s) => Some(s.max_memory()),
            _ => None,
        }
    }

    fn inner(&mut self) -> &mut dyn ComputeStrategy {
        match self {
            Strategy::Fixed(s) => s,
            Strategy::Edge(s) => s,
            Strategy::Adaptive(s) => s,
        }
    }
}

impl ComputeStrategy for Strategy {
    fn compute(
        &mut self,
        cx: LayerContext<'_>,
        outputs: LayerOutputs,
    ) -> crate::Result<LayerOutputs> {
        self.inner().compute(cx, outputs)
    }

    fn device(&self) -> &Device {
        match self {
            Strategy::Fixed(s) => s.device(),
            Strategy::Edge(s) => s.device(),
            Strategy::Adaptive(s) => s.device(),
        }
    }

    fn before_inference(&mut self, graph: &CsrGraph, args: &[Value]) -> crate::Result<()> {
        self.inner().before_inference(graph, args)
    }

    fn after_inference(&mut self) {
        self.inner().after_inference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::GraphReplicator;
    use crate::sampling::Block;

    #[test]
    fn test_gather_selects_rows() {
        let graph = CsrGraph::from_edges(4, &[(0, 1), (2, 1)]).unwrap();
        let mut rep = GraphReplicator::new();
        rep.declare_inputs(["graph", "x", "scale", "__block_0"]).unwrap();
        rep.finalize_outputs(["x"]).unwrap();
        let mut schema = Schema::new();
        schema.record_endpoints(&rep.finish()).unwrap();

        let mut layer_graph = GraphReplicator::new();
        layer_graph.declare_inputs(["x", "scale", "__block_0"]).unwrap();
        layer_graph.finalize_outputs(Vec::<String>::new()).unwrap();
        schema.add_layer(&layer_graph.finish()).unwrap();

        let x = Tensor::arange(0f32, 8.0, &Device::Cpu).unwrap().reshape((4, 2)).unwrap();
        let mut values = HashMap::new();
        values.insert(schema.arg_id("x").unwrap(), Value::Tensor(x));
        values.insert(schema.arg_id("scale").unwrap(), Value::Float(0.5));

        let batch = Batch::from_block(Block::from_graph(&graph, &[1]).unwrap());
        let layer = schema.get_layer(0).unwrap();
        let args = gather_args(&schema, layer, &values, &batch, 4, &Device::Cpu).unwrap();

        let rows: Vec<Vec<f32>> = args[0].as_tensor().unwrap().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![2.0, 3.0], vec![0.0, 1.0], vec![4.0, 5.0]]);
        assert!(matches!(args[1], Value::Float(_)));
        assert_eq!(args[2].as_block().unwrap().num_dst_nodes(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = InferenceConfig::default().with_strategy(StrategyKind::Fixed);
        let strategy = Strategy::from_config(&config, Device::Cpu).unwrap();
        assert_eq!(strategy.kind(), StrategyKind::Fixed);
        assert!(strategy.max_memory().is_none());

        let bad = InferenceConfig::default().with_batch_size(0);
        assert!(Strategy::from_config(&bad, Device::Cpu).is_err());
    }
}
