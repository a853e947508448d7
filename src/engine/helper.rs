//! Layer-by-layer inference driver.

use std::collections::HashMap;
use std::sync::Arc;

use super::buffer::{LayerOutputs, OutputSpec};
use super::strategy::{gather_args, ComputeStrategy, LayerContext, Strategy};
use crate::compiler::{ArgId, FunctionGenerator, Layer, LayerFn, Schema};
use crate::config::InferenceConfig;
use crate::ir::Value;
use crate::model::Traceable;
use crate::sampling::{Batch, CsrGraph};
use crate::utils::{format_bytes, Device, DeviceMemory, HostMemory, MemoryContext};

/// Runs a split model over a whole graph, one layer at a time.
///
/// Each layer is computed for every node before the next one starts, so only
/// the buffers still needed by later layers stay alive. The first layer
/// receives the graph followed by the caller's arguments.
pub struct InferenceHelper<S: ComputeStrategy = Strategy> {
    schema: Schema,
    funcs: Vec<Arc<dyn LayerFn>>,
    strategy: S,
    memory: MemoryContext,
    peak_memory: usize,
}

impl InferenceHelper<Strategy> {
    /// Split `module` and pick the strategy and memory limit from `config`
    pub fn from_config(
        module: &dyn Traceable,
        config: &InferenceConfig,
        device: Device,
    ) -> crate::Result<Self> {
        let strategy = Strategy::from_config(config, device)?;
        let memory: Arc<dyn DeviceMemory> = match config.memory_limit_bytes {
            Some(limit) => Arc::new(HostMemory::new(limit)),
            None => Arc::new(HostMemory::system()),
        };
        Ok(Self::new(module, strategy)?.with_memory(memory))
    }
}

impl<S: ComputeStrategy> InferenceHelper<S> {
    pub fn new(module: &dyn Traceable, strategy: S) -> crate::Result<Self> {
        let (schema, funcs) = FunctionGenerator::compile(module)?.into_parts();
        Self::from_parts(schema, funcs, strategy)
    }

    /// Use pre-built layer functions, index-aligned with the schema's layers
    pub fn from_parts(
        schema: Schema,
        funcs: Vec<Arc<dyn LayerFn>>,
        strategy: S,
    ) -> crate::Result<Self> {
        if funcs.len() != schema.layer_count() {
            return Err(crate::LayerwiseError::ConfigError(format!(
                "{} layer functions for {} schema layers",
                funcs.len(),
                schema.layer_count()
            )));
        }
        schema.validate()?;

        Ok(Self {
            schema,
            funcs,
            strategy,
            memory: MemoryContext::new(Arc::new(HostMemory::system())),
            peak_memory: 0,
        })
    }

    /// Account batches against `memory` instead of system memory
    pub fn with_memory(mut self, memory: Arc<dyn DeviceMemory>) -> Self {
        self.memory = MemoryContext::new(memory);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    /// Highest per-layer memory peak of the last call
    pub fn peak_memory(&self) -> usize {
        self.peak_memory
    }

    /// Run the model over every node of `graph`.
    ///
    /// Returns the model's single output, or a tuple when it has several.
    pub fn inference(&mut self, graph: &Arc<CsrGraph>, args: Vec<Value>) -> crate::Result<Value> {
        self.strategy.before_inference(graph, &args)?;
        let result = self.run(graph, args);
        self.strategy.after_inference();
        result
    }

    fn run(&mut self, graph: &Arc<CsrGraph>, args: Vec<Value>) -> crate::Result<Value> {
        let first_inputs = self.schema.first_layer_inputs();
        if args.len() + 1 != first_inputs.len() {
            return Err(crate::LayerwiseError::ArityMismatch {
                expected: first_inputs.len(),
                actual: args.len() + 1,
            });
        }
        if graph.num_nodes() == 0 {
            return Err(crate::LayerwiseError::ConfigError(
                "cannot run inference on a graph with no nodes".to_string(),
            ));
        }

        let mut values: HashMap<ArgId, Value> = first_inputs
            .iter()
            .copied()
            .zip(std::iter::once(Value::Graph(graph.clone())).chain(args))
            .collect();

        let specs = self.probe(graph, &values)?;
        self.peak_memory = 0;

        let num_layers = self.schema.layer_count();
        for (layer, func) in self.schema.layers().iter().zip(&self.funcs) {
            tracing::info!("Running layer {}/{}", layer.id + 1, num_layers);

            let outputs = LayerOutputs::allocate(layer.id, &specs[layer.id], graph.num_nodes())?;
            tracing::debug!(
                "Layer {} output buffers: {}",
                layer.id,
                format_bytes(outputs.host_bytes() as u64)
            );
            self.memory.clear_caches();
            self.memory.reset_peak();

            let cx = LayerContext {
                graph,
                values: &values,
                schema: &self.schema,
                layer,
                func: func.as_ref(),
                memory: &self.memory,
            };
            let outputs = self.strategy.compute(cx, outputs)?;
            let results = outputs.finish()?;
            self.peak_memory = self.peak_memory.max(self.memory.peak());

            release_consumed(&self.schema, layer, &mut values);
            for (&id, value) in layer.outputs.iter().zip(results) {
                values.insert(id, value);
            }
        }

        let outputs = self
            .schema
            .last_layer_outputs()
            .iter()
            .map(|id| {
                // An output may be listed more than once
                values.get(id).cloned().ok_or_else(|| {
                    crate::LayerwiseError::EvalError(format!(
                        "model output `{}` was never computed",
                        self.schema.arg(*id).name
                    ))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Value::from_outputs(outputs))
    }

    /// Run every layer once on a one-node batch to learn its output shapes.
    ///
    /// Works on a copy of `values`, so the real value map is untouched.
    fn probe(
        &self,
        graph: &Arc<CsrGraph>,
        values: &HashMap<ArgId, Value>,
    ) -> crate::Result<Vec<Vec<OutputSpec>>> {
        let mut probe_values = values.clone();
        let batch = Batch::probe();
        let device = self.strategy.device();

        let mut specs = Vec::with_capacity(self.funcs.len());
        for (layer, func) in self.schema.layers().iter().zip(&self.funcs) {
            let args = gather_args(
                &self.schema,
                layer,
                &probe_values,
                &batch,
                graph.num_nodes(),
                device,
            )?;
            let outputs = func.call(&args)?.into_outputs();
            if outputs.len() != layer.outputs.len() {
                return Err(crate::LayerwiseError::OutputArityMismatch {
                    layer: layer.id,
                    expected: layer.outputs.len(),
                    actual: outputs.len(),
                });
            }

            specs.push(outputs.iter().map(OutputSpec::of).collect());
            for (&id, value) in layer.outputs.iter().zip(outputs) {
                probe_values.insert(id, value);
            }
        }
        tracing::debug!("Probed output specs: {:?}", specs);
        Ok(specs)
    }
}

/// Drop the inputs of `layer` that no later layer reads.
///
/// Blocks are rebuilt per batch and the model's own inputs stay for the
/// whole call, so neither is touched.
fn release_consumed(schema: &Schema, layer: &Layer, values: &mut HashMap<ArgId, Value>) {
    for &input in &layer.inputs {
        let arg = schema.arg(input);
        if !arg.is_block
            && !schema.is_retained(input)
            && arg.last_consumer() == Some(layer.id)
            && values.remove(&input).is_some()
        {
            tracing::debug!("Released `{}` after layer {}", arg.name, layer.id);
        }
    }
}
