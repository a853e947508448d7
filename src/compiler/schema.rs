//! Cross-layer bookkeeping: which layer produces and consumes each value.

use std::collections::HashMap;
use std::fmt;

use super::rewriter::is_block_name;
use crate::ir::Graph;

/// Index of an [`ArgNode`] in its schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgId(usize);

impl ArgId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One logical value crossing layer boundaries
#[derive(Debug, Clone, PartialEq)]
pub struct ArgNode {
    pub name: String,
    /// Consuming layers, ascending
    pub input_layers: Vec<usize>,
    /// Producing layer; `None` for external inputs and blocks
    pub output_layer: Option<usize>,
    pub is_block: bool,
}

impl ArgNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            input_layers: Vec::new(),
            output_layer: None,
            is_block: is_block_name(name),
        }
    }

    /// Last layer reading this value
    pub fn last_consumer(&self) -> Option<usize> {
        self.input_layers.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub id: usize,
    pub inputs: Vec<ArgId>,
    pub outputs: Vec<ArgId>,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    args: Vec<ArgNode>,
    by_name: HashMap<String, ArgId>,
    layers: Vec<Layer>,
    first_layer_inputs: Vec<ArgId>,
    last_layer_outputs: Vec<ArgId>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, name: &str) -> ArgId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = ArgId(self.args.len());
        self.args.push(ArgNode::new(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Record the whole model's inputs (blocks excluded) and outputs
    pub fn record_endpoints(&mut self, graph: &Graph) -> crate::Result<()> {
        for id in graph.placeholders() {
            let name = graph.node(id)?.name();
            if !is_block_name(name) {
                let arg = self.intern(name);
                self.first_layer_inputs.push(arg);
            }
        }
        for &id in graph.output_values() {
            let name = graph.node(id)?.name();
            let arg = self.intern(name);
            self.last_layer_outputs.push(arg);
        }
        Ok(())
    }

    /// Register the next layer's graph, returning its id.
    ///
    /// Every input must be a block, an external input or the output of an
    /// earlier layer.
    pub fn add_layer(&mut self, graph: &Graph) -> crate::Result<usize> {
        let layer_id = self.layers.len();

        let mut inputs = Vec::new();
        for id in graph.placeholders() {
            let arg = self.intern(graph.node(id)?.name());
            let node = &self.args[arg.0];
            let available = node.is_block
                || self.first_layer_inputs.contains(&arg)
                || node.output_layer.is_some_and(|l| l < layer_id);
            if !available {
                return Err(crate::LayerwiseError::GraphError(format!(
                    "layer {} reads `{}` before any layer produces it",
                    layer_id, node.name
                )));
            }
            inputs.push(arg);
        }

        let mut outputs = Vec::new();
        for &id in graph.output_values() {
            let arg = self.intern(graph.node(id)?.name());
            let node = &self.args[arg.0];
            if node.output_layer.is_some() || node.is_block || self.first_layer_inputs.contains(&arg) {
                return Err(crate::LayerwiseError::GraphError(format!(
                    "layer {} redefines `{}`",
                    layer_id, node.name
                )));
            }
            outputs.push(arg);
        }

        for &arg in &inputs {
            self.args[arg.0].input_layers.push(layer_id);
        }
        for &arg in &outputs {
            self.args[arg.0].output_layer = Some(layer_id);
        }
        self.layers.push(Layer {
            id: layer_id,
            inputs,
            outputs,
        });
        Ok(layer_id)
    }

    pub fn get_layer(&self, id: usize) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn arg(&self, id: ArgId) -> &ArgNode {
        &self.args[id.0]
    }

    pub fn arg_id(&self, name: &str) -> Option<ArgId> {
        self.by_name.get(name).copied()
    }

    pub fn first_layer_inputs(&self) -> &[ArgId] {
        &self.first_layer_inputs
    }

    pub fn last_layer_outputs(&self) -> &[ArgId] {
        &self.last_layer_outputs
    }

    /// Values kept for the whole inference call
    pub fn is_retained(&self, id: ArgId) -> bool {
        self.first_layer_inputs.contains(&id) || self.last_layer_outputs.contains(&id)
    }

    /// Check that every model output is produced by some layer or passed
    /// straight through from an input.
    pub fn validate(&self) -> crate::Result<()> {
        for &id in &self.last_layer_outputs {
            let arg = &self.args[id.0];
            if arg.output_layer.is_none() && !self.first_layer_inputs.contains(&id) {
                return Err(crate::LayerwiseError::ConfigError(format!(
                    "model output `{}` is not produced by any layer",
                    arg.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |ids: &[ArgId]| -> String {
            ids.iter()
                .map(|&id| self.args[id.0].name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(f, "inputs: ({})", names(&self.first_layer_inputs))?;
        for layer in &self.layers {
            writeln!(
                f,
                "layer {}: ({}) -> ({})",
                layer.id,
                names(&layer.inputs),
                names(&layer.outputs)
            )?;
        }
        write!(f, "outputs: ({})", names(&self.last_layer_outputs))
    }
}
