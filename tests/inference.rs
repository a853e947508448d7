use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};

use rs_layerwise::compiler::LayerFn;
use rs_layerwise::engine::{AdaptiveStrategy, EdgeBudgetStrategy, FixedBatchStrategy};
use rs_layerwise::sampling::Reduce;
use rs_layerwise::trace::{Proxy, Tracer};
use rs_layerwise::{
    BatchDataSource, Block, ComponentRegistry, CsrGraph, FullNeighborSampler, FunctionGenerator,
    GraphSage, HostMemory, InferenceConfig, InferenceHelper, LayerwiseError, StrategyKind,
    Traceable, Value,
};

/// Every node adds its in-neighbors' features to its own
fn own_plus_neighbors(block: &Block, feats: &Tensor) -> rs_layerwise::Result<Tensor> {
    let own = feats.narrow(0, 0, block.num_dst_nodes())?;
    let neigh = block.aggregate(feats, Reduce::Sum)?;
    Ok((own + neigh)?)
}

/// Two rounds of `own_plus_neighbors`, one per block
struct ChainSum;

impl Traceable for ChainSum {
    fn input_names(&self) -> Vec<String> {
        vec!["graph".to_string(), "x".to_string()]
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Proxy]) -> rs_layerwise::Result<Vec<Proxy>> {
        let (graph, x) = (inputs[0], inputs[1]);
        let b0 = tracer.get_block(graph, 0)?;
        let h = tracer.call_module("agg", vec![b0.into(), x.into()])?;
        let b1 = tracer.get_block(graph, 1)?;
        let out = tracer.call_module("agg", vec![b1.into(), h.into()])?;
        Ok(vec![out])
    }

    fn components(&self) -> ComponentRegistry {
        ComponentRegistry::new().with(
            "agg",
            Arc::new(|args: &[Value]| -> rs_layerwise::Result<Value> {
                let block = args[0].as_block()?;
                let feats = args[1].as_tensor()?;
                Ok(Value::Tensor(own_plus_neighbors(block, feats)?))
            }),
        )
    }
}

/// Layer 0 hands two values to layer 1
struct TwoCarry;

impl Traceable for TwoCarry {
    fn input_names(&self) -> Vec<String> {
        vec!["graph".to_string(), "x".to_string()]
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Proxy]) -> rs_layerwise::Result<Vec<Proxy>> {
        let (graph, x) = (inputs[0], inputs[1]);
        let b0 = tracer.get_block(graph, 0)?;
        let h = tracer.call_module("agg", vec![b0.into(), x.into()])?;
        let r = tracer.relu(h)?;
        let b1 = tracer.get_block(graph, 1)?;
        let y = tracer.call_module("agg", vec![b1.into(), h.into()])?;
        let r = tracer.call_module("own", vec![b1.into(), r.into()])?;
        let out = tracer.add(y, r)?;
        Ok(vec![out])
    }

    fn components(&self) -> ComponentRegistry {
        ChainSum.components().with(
            "own",
            Arc::new(|args: &[Value]| -> rs_layerwise::Result<Value> {
                let block = args[0].as_block()?;
                let feats = args[1].as_tensor()?;
                Ok(Value::Tensor(feats.narrow(0, 0, block.num_dst_nodes())?))
            }),
        )
    }
}

/// Hands its input rows straight back
struct Passthrough;

impl Traceable for Passthrough {
    fn input_names(&self) -> Vec<String> {
        vec!["graph".to_string(), "x".to_string()]
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Proxy]) -> rs_layerwise::Result<Vec<Proxy>> {
        let b0 = tracer.get_block(inputs[0], 0)?;
        let y = tracer.call_module("own", vec![b0.into(), inputs[1].into()])?;
        Ok(vec![y])
    }

    fn components(&self) -> ComponentRegistry {
        TwoCarry.components()
    }
}

/// Returns the same value twice
struct Twice;

impl Traceable for Twice {
    fn input_names(&self) -> Vec<String> {
        vec!["graph".to_string(), "x".to_string()]
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Proxy]) -> rs_layerwise::Result<Vec<Proxy>> {
        let outputs = ChainSum.forward(tracer, inputs)?;
        Ok(vec![outputs[0], outputs[0]])
    }

    fn components(&self) -> ComponentRegistry {
        ChainSum.components()
    }
}

fn chain(n: u32) -> Arc<CsrGraph> {
    let edges: Vec<(u32, u32)> = (0..n - 1).map(|i| (i, i + 1)).collect();
    Arc::new(CsrGraph::from_edges(n as usize, &edges).unwrap())
}

fn full_chain_sum(graph: &CsrGraph, x: &Tensor) -> Tensor {
    let all: Vec<u32> = (0..graph.num_nodes() as u32).collect();
    let block = Block::from_graph(graph, &all).unwrap();
    let h = own_plus_neighbors(&block, x).unwrap();
    own_plus_neighbors(&block, &h).unwrap()
}

fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap()
}

#[test]
fn test_chain_two_layers_batch_two() {
    let graph = chain(5);
    let x = Tensor::new(&[[1f32], [2.], [3.], [4.], [5.]], &Device::Cpu).unwrap();

    let mut helper =
        InferenceHelper::new(&ChainSum, FixedBatchStrategy::new(2, Device::Cpu)).unwrap();
    assert_eq!(helper.schema().layer_count(), 2);

    let out = helper.inference(&graph, vec![Value::Tensor(x)]).unwrap();
    let rows: Vec<Vec<f32>> = out.as_tensor().unwrap().to_vec2().unwrap();
    assert_eq!(
        rows,
        vec![vec![1.0], vec![4.0], vec![8.0], vec![12.0], vec![16.0]]
    );
}

#[test]
fn test_probe_rejects_extra_outputs() {
    let generator = FunctionGenerator::compile(&TwoCarry).unwrap();
    let schema = generator.schema().clone();
    assert_eq!(schema.get_layer(0).unwrap().outputs.len(), 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let bad: Arc<dyn LayerFn> = Arc::new(move |_: &[Value]| -> rs_layerwise::Result<Value> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Tuple(vec![Value::None, Value::None, Value::None]))
    });
    let never: Arc<dyn LayerFn> = Arc::new(|_: &[Value]| -> rs_layerwise::Result<Value> {
        panic!("layer 1 must not run")
    });

    let mut helper =
        InferenceHelper::from_parts(schema, vec![bad, never], FixedBatchStrategy::new(2, Device::Cpu))
            .unwrap();
    let x = Tensor::zeros((5, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
    let err = helper.inference(&chain(5), vec![Value::Tensor(x)]).unwrap_err();

    assert!(matches!(
        err,
        LayerwiseError::OutputArityMismatch { layer: 0, expected: 2, actual: 3 }
    ));
    assert!(err.is_configuration());
    // only the probe ran
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_two_carried_values() {
    let graph = chain(6);
    let x = Tensor::arange(0f32, 6.0, &Device::Cpu).unwrap().reshape((6, 1)).unwrap();

    let mut helper =
        InferenceHelper::new(&TwoCarry, FixedBatchStrategy::new(4, Device::Cpu)).unwrap();
    let out = helper.inference(&graph, vec![Value::Tensor(x.clone())]).unwrap();

    let all: Vec<u32> = (0..6).collect();
    let block = Block::from_graph(&graph, &all).unwrap();
    let h = own_plus_neighbors(&block, &x).unwrap();
    let expected = (own_plus_neighbors(&block, &h).unwrap() + h.relu().unwrap()).unwrap();
    assert!(max_diff(out.as_tensor().unwrap(), &expected) < 1e-6);
}

#[test]
fn test_adaptive_recovers_from_exhaustion() {
    let graph = chain(64);
    let x = Tensor::randn(0f32, 1.0, (64, 4), &Device::Cpu).unwrap();

    // A full 64-node batch needs about 2 KiB; only much smaller ones fit
    let strategy = AdaptiveStrategy::new(Device::Cpu);
    let mut helper = InferenceHelper::new(&ChainSum, strategy)
        .unwrap()
        .with_memory(Arc::new(HostMemory::new(600)));

    let out = helper.inference(&graph, vec![Value::Tensor(x.clone())]).unwrap();
    let out = out.as_tensor().unwrap();
    assert_eq!(out.dims(), &[64, 4]);
    assert!(max_diff(out, &full_chain_sum(&graph, &x)) < 1e-5);

    assert!(helper.strategy().failures() > 0);
    assert!(helper.strategy().max_memory() > 0);
    assert!(helper.strategy().max_memory() <= 600);
}

#[test]
fn test_adaptive_single_node_too_large() {
    let graph = chain(8);
    let x = Tensor::randn(0f32, 1.0, (8, 64), &Device::Cpu).unwrap();

    let mut helper = InferenceHelper::new(&ChainSum, AdaptiveStrategy::new(Device::Cpu))
        .unwrap()
        .with_memory(Arc::new(HostMemory::new(64)));
    let err = helper.inference(&graph, vec![Value::Tensor(x)]).unwrap_err();
    assert!(err.is_resource_exhaustion());
}

#[test]
fn test_fixed_batch_size_invariance() {
    let device = Device::Cpu;
    let model = GraphSage::new(&[5, 8, 3], &device).unwrap();
    let graph = Arc::new(CsrGraph::random(40, 4, 7).unwrap());
    let x = Tensor::randn(0f32, 1.0, (40, 5), &device).unwrap();

    let mut one = InferenceHelper::new(&model, FixedBatchStrategy::new(1, device.clone())).unwrap();
    let mut many = InferenceHelper::new(&model, FixedBatchStrategy::new(40, device.clone())).unwrap();
    let a = one.inference(&graph, vec![Value::Tensor(x.clone())]).unwrap();
    let b = many.inference(&graph, vec![Value::Tensor(x.clone())]).unwrap();

    assert!(max_diff(a.as_tensor().unwrap(), b.as_tensor().unwrap()) < 1e-5);
    let full = model.full_forward(&graph, &x).unwrap();
    assert!(max_diff(a.as_tensor().unwrap(), &full) < 1e-4);
}

#[test]
fn test_edge_budget_matches_full_forward() {
    let device = Device::Cpu;
    let model = GraphSage::new(&[3, 4, 2], &device).unwrap();
    let graph = Arc::new(CsrGraph::random(25, 3, 3).unwrap());
    let x = Tensor::randn(0f32, 1.0, (25, 3), &device).unwrap();

    let mut helper =
        InferenceHelper::new(&model, EdgeBudgetStrategy::new(5, device.clone())).unwrap();
    let out = helper.inference(&graph, vec![Value::Tensor(x.clone())]).unwrap();
    let full = model.full_forward(&graph, &x).unwrap();
    assert!(max_diff(out.as_tensor().unwrap(), &full) < 1e-4);
}

#[test]
fn test_from_config_with_prefetch() {
    let device = Device::Cpu;
    let model = GraphSage::new(&[3, 2], &device).unwrap();
    let graph = Arc::new(CsrGraph::random(30, 2, 1).unwrap());
    let x = Tensor::randn(0f32, 1.0, (30, 3), &device).unwrap();

    let config = InferenceConfig::default()
        .with_strategy(StrategyKind::Fixed)
        .with_batch_size(4)
        .with_workers(1)
        .with_memory_limit(1 << 20)
        .with_progress(false);
    let mut helper = InferenceHelper::from_config(&model, &config, device).unwrap();
    let out = helper.inference(&graph, vec![Value::Tensor(x.clone())]).unwrap();

    let full = model.full_forward(&graph, &x).unwrap();
    assert!(max_diff(out.as_tensor().unwrap(), &full) < 1e-4);
    assert!(helper.peak_memory() > 0);
}

#[test]
fn test_requeue_partition_law() {
    let graph = Arc::new(CsrGraph::random(50, 3, 5).unwrap());
    let mut source = BatchDataSource::new(graph, FullNeighborSampler::default(), 0..50u32)
        .with_budget(8, usize::MAX);

    let mut seen = Vec::new();
    let mut round = 0;
    while let Some(batch) = source.next_batch().unwrap() {
        round += 1;
        if round % 3 == 0 && batch.output_nodes.len() > 2 {
            // give back the tail, keep the head
            let keep = batch.output_nodes.len() - 3;
            source.requeue(3).unwrap();
            seen.extend_from_slice(&batch.output_nodes[..keep]);
            source.set_max_node(5);
            continue;
        }
        seen.extend_from_slice(&batch.output_nodes);
    }

    assert_eq!(seen.len(), 50);
    let unique: HashSet<u32> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 50);
}

#[test]
fn test_passthrough_keeps_wide_dtypes() {
    let graph = chain(2);
    let mut helper =
        InferenceHelper::new(&Passthrough, FixedBatchStrategy::new(2, Device::Cpu)).unwrap();

    let x = Tensor::new(&[[16777217f64], [0.1]], &Device::Cpu).unwrap();
    let out = helper.inference(&graph, vec![Value::Tensor(x)]).unwrap();
    let out = out.as_tensor().unwrap();
    assert_eq!(out.dtype(), candle_core::DType::F64);
    assert_eq!(out.to_vec2::<f64>().unwrap(), vec![vec![16777217.0], vec![0.1]]);

    let x = Tensor::new(&[[16777217i64], [3]], &Device::Cpu).unwrap();
    let out = helper.inference(&graph, vec![Value::Tensor(x)]).unwrap();
    assert_eq!(
        out.as_tensor().unwrap().to_vec2::<i64>().unwrap(),
        vec![vec![16777217], vec![3]]
    );
}

#[test]
fn test_repeated_model_output() {
    let graph = chain(5);
    let x = Tensor::new(&[[1f32], [2.], [3.], [4.], [5.]], &Device::Cpu).unwrap();

    let mut helper = InferenceHelper::new(&Twice, FixedBatchStrategy::new(2, Device::Cpu)).unwrap();
    let out = helper.inference(&graph, vec![Value::Tensor(x)]).unwrap();
    let outputs = out.into_outputs();
    assert_eq!(outputs.len(), 2);
    for value in &outputs {
        let rows: Vec<Vec<f32>> = value.as_tensor().unwrap().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1.0], vec![4.0], vec![8.0], vec![12.0], vec![16.0]]);
    }
}
