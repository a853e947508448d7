//! Compiles a traceable module into per-layer functions and their schema.

use std::sync::Arc;

use super::function::{LayerFn, LayerFunction};
use super::rearranger::GraphRearranger;
use super::rewriter::{normalize, prune};
use super::schema::Schema;
use crate::ir::Graph;
use crate::model::{ComponentRegistry, Traceable};
use crate::trace::SymbolicTracer;

/// Output of layer splitting: one function per layer, index-aligned with the
/// schema's layers.
pub struct FunctionGenerator {
    schema: Schema,
    funcs: Vec<Arc<dyn LayerFn>>,
    traced: Graph,
    layer_graphs: Vec<Graph>,
}

impl FunctionGenerator {
    /// Trace `module` and split it
    pub fn compile(module: &dyn Traceable) -> crate::Result<Self> {
        let graph = SymbolicTracer::trace(module)?;
        Self::from_graph(graph, &module.components())
    }

    /// Split an already traced graph
    pub fn from_graph(mut graph: Graph, registry: &ComponentRegistry) -> crate::Result<Self> {
        if graph.is_empty() || graph.output().is_none() {
            return Err(crate::LayerwiseError::ConfigError(
                "traced graph is empty or has no output".to_string(),
            ));
        }
        tracing::debug!("Traced graph:\n{}", graph);

        let selections = normalize(&mut graph)?;
        let mut schema = Schema::new();
        schema.record_endpoints(&graph)?;
        let pruned = prune(&mut graph);
        tracing::debug!(
            "Normalized graph ({} block selections, {} dead nodes removed):\n{}",
            selections,
            pruned,
            graph
        );

        let mut layer_graphs = GraphRearranger::new(&graph).split()?;
        let mut funcs: Vec<Arc<dyn LayerFn>> = Vec::with_capacity(layer_graphs.len());
        for layer_graph in layer_graphs.iter_mut() {
            prune(layer_graph);
            let id = schema.add_layer(layer_graph)?;
            tracing::debug!("Layer {}:\n{}", id, layer_graph);
            funcs.push(Arc::new(LayerFunction::new(layer_graph.clone(), registry)?));
        }
        schema.validate()?;

        if funcs.len() != layer_graphs.len() || schema.layer_count() != layer_graphs.len() {
            return Err(crate::LayerwiseError::ConfigError(format!(
                "split produced {} graphs but {} functions and {} schema layers",
                layer_graphs.len(),
                funcs.len(),
                schema.layer_count()
            )));
        }

        tracing::info!(
            "Split model into {} layers ({} inputs, {} outputs)",
            schema.layer_count(),
            schema.first_layer_inputs().len(),
            schema.last_layer_outputs().len()
        );

        Ok(Self {
            schema,
            funcs,
            traced: graph,
            layer_graphs,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn funcs(&self) -> &[Arc<dyn LayerFn>] {
        &self.funcs
    }

    /// The normalized whole-model graph
    pub fn traced(&self) -> &Graph {
        &self.traced
    }

    pub fn layer_graphs(&self) -> &[Graph] {
        &self.layer_graphs
    }

    pub fn into_parts(self) -> (Schema, Vec<Arc<dyn LayerFn>>) {
        (self.schema, self.funcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builtin, Target};

    #[test]
    fn test_compile_graph_sage() {
        let model = crate::GraphSage::new(&[4, 6, 2], &candle_core::Device::Cpu).unwrap();
        let generator = FunctionGenerator::compile(&model).unwrap();
        let schema = generator.schema();
        assert_eq!(schema.layer_count(), 2);
        assert_eq!(generator.funcs().len(), 2);

        let inputs: Vec<&str> = schema
            .first_layer_inputs()
            .iter()
            .map(|&id| schema.arg(id).name.as_str())
            .collect();
        assert_eq!(inputs, vec!["graph", "features"]);

        // features -> layer 0; relu -> layer 1; output from layer 1
        let relu = schema.arg(schema.arg_id("relu").unwrap());
        assert_eq!(relu.output_layer, Some(0));
        assert_eq!(relu.input_layers, vec![1]);
        let out = schema.arg(schema.last_layer_outputs()[0]);
        assert_eq!(out.output_layer, Some(1));
    }

    #[test]
    fn test_unresolved_component() {
        let mut g = Graph::new();
        let graph_in = g.placeholder("graph").unwrap();
        let x = g.placeholder("x").unwrap();
        let b = g
            .call("get_block", Target::Builtin(Builtin::GetBlock), vec![graph_in.into(), 0i64.into()])
            .unwrap();
        let h = g.call("conv", Target::Module("conv".into()), vec![b.into(), x.into()]).unwrap();
        g.set_output(vec![h]).unwrap();

        let err = FunctionGenerator::from_graph(g, &ComponentRegistry::new()).err().unwrap();
        assert!(matches!(err, crate::LayerwiseError::UnresolvedComponent(ref n) if n == "conv"));
    }

    #[test]
    fn test_empty_graph_rejected() {
        let err = FunctionGenerator::from_graph(Graph::new(), &ComponentRegistry::new())
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }
}
