//! GraphSAGE reference model with mean aggregation.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder, VarMap};

use super::base::{Component, ComponentRegistry, Traceable};
use crate::ir::Value;
use crate::sampling::{Block, CsrGraph, Reduce};
use crate::trace::{Proxy, Tracer};

/// One SAGE convolution: `W_self · h_v + W_neigh · mean(h_u for u → v)`
pub struct SageConv {
    self_proj: Linear,
    neigh_proj: Linear,
    in_dim: usize,
    out_dim: usize,
}

impl SageConv {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> crate::Result<Self> {
        let self_proj = candle_nn::linear(in_dim, out_dim, vb.pp("self_proj"))?;
        let neigh_proj = candle_nn::linear_no_bias(in_dim, out_dim, vb.pp("neigh_proj"))?;
        Ok(Self {
            self_proj,
            neigh_proj,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `src_feats` has one row per block source; returns one row per
    /// destination.
    pub fn apply(&self, block: &Block, src_feats: &Tensor) -> crate::Result<Tensor> {
        let dst_feats = src_feats.narrow(0, 0, block.num_dst_nodes())?;
        let neigh = block.aggregate(src_feats, Reduce::Mean)?;
        let out = (self.self_proj.forward(&dst_feats)? + self.neigh_proj.forward(&neigh)?)?;
        Ok(out)
    }
}

impl Component for SageConv {
    fn forward(&self, args: &[Value]) -> crate::Result<Value> {
        match args {
            [block, feats] => Ok(Value::Tensor(self.apply(block.as_block()?, feats.as_tensor()?)?)),
            _ => Err(crate::LayerwiseError::EvalError(format!(
                "SageConv takes (block, features), got {} arguments",
                args.len()
            ))),
        }
    }
}

/// Stack of [`SageConv`] layers with ReLU between them
pub struct GraphSage {
    layers: Vec<Arc<SageConv>>,
    device: Device,
    // Keeps the weights alive for the convs' views
    _varmap: VarMap,
}

impl GraphSage {
    /// `dims` lists the feature width at every stage: input, hidden..., output
    pub fn new(dims: &[usize], device: &Device) -> crate::Result<Self> {
        if dims.len() < 2 {
            return Err(crate::LayerwiseError::ConfigError(format!(
                "GraphSage needs at least input and output widths, got {:?}",
                dims
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(l, w)| SageConv::new(w[0], w[1], vb.pp(format!("layers.{}", l))).map(Arc::new))
            .collect::<crate::Result<Vec<_>>>()?;

        tracing::debug!("Built GraphSage with {} layers, dims {:?}", layers.len(), dims);

        Ok(Self {
            layers,
            device: device.clone(),
            _varmap: varmap,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn in_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.in_dim())
    }

    pub fn out_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.out_dim())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whole-graph forward in one pass, for checking layer-wise results on
    /// graphs that fit in memory.
    pub fn full_forward(&self, graph: &CsrGraph, features: &Tensor) -> crate::Result<Tensor> {
        let all: Vec<u32> = (0..graph.num_nodes() as u32).collect();
        let block = Block::from_graph(graph, &all)?;
        let mut h = features.clone();
        for (l, layer) in self.layers.iter().enumerate() {
            h = layer.apply(&block, &h)?;
            if l + 1 != self.layers.len() {
                h = h.relu()?;
            }
        }
        Ok(h)
    }
}

impl Traceable for GraphSage {
    fn input_names(&self) -> Vec<String> {
        vec!["graph".to_string(), "features".to_string()]
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Proxy]) -> crate::Result<Vec<Proxy>> {
        let (graph, mut h) = match inputs {
            [graph, features] => (*graph, *features),
            _ => {
                return Err(crate::LayerwiseError::ArityMismatch {
                    expected: 2,
                    actual: inputs.len(),
                })
            }
        };

        for l in 0..self.layers.len() {
            let block = tracer.get_block(graph, l)?;
            h = tracer.call_module(&format!("layers.{}", l), vec![block.into(), h.into()])?;
            if l + 1 != self.layers.len() {
                h = tracer.relu(h)?;
            }
        }
        Ok(vec![h])
    }

    fn components(&self) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        for (l, layer) in self.layers.iter().enumerate() {
            registry.register(format!("layers.{}", l), layer.clone() as Arc<dyn Component>);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::SymbolicTracer;

    #[test]
    fn test_shapes() {
        let model = GraphSage::new(&[4, 8, 3], &Device::Cpu).unwrap();
        assert_eq!(model.num_layers(), 2);
        assert_eq!((model.in_dim(), model.out_dim()), (4, 3));

        let graph = CsrGraph::from_edges(5, &[(0, 1), (1, 2), (3, 2)]).unwrap();
        let x = Tensor::randn(0f32, 1.0, (5, 4), &Device::Cpu).unwrap();
        let out = model.full_forward(&graph, &x).unwrap();
        assert_eq!(out.dims(), &[5, 3]);
    }

    #[test]
    fn test_trace_has_one_block_per_layer() {
        let model = GraphSage::new(&[4, 8, 8, 2], &Device::Cpu).unwrap();
        let graph = SymbolicTracer::trace(&model).unwrap();
        let blocks = graph
            .iter()
            .filter(|(_, n)| n.name().starts_with("get_block"))
            .count();
        assert_eq!(blocks, 3);
        assert_eq!(model.components().len(), 3);
    }

    #[test]
    fn test_rejects_single_width() {
        assert!(GraphSage::new(&[4], &Device::Cpu).is_err());
    }
}
