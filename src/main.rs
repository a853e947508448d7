//! Layer-wise graph inference CLI
//!
//! Runs a GraphSAGE model over a whole graph one layer at a time, with
//! batches sized to fit the configured memory budget.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};

use rs_layerwise::{
    utils::{device_label, format_bytes},
    CsrGraph, FunctionGenerator, GraphSage, InferenceConfig, InferenceHelper,
    StrategyKind, Value,
};

#[derive(Parser)]
#[command(name = "layerwise")]
#[command(author, version, about = "Memory-bounded layer-wise graph inference", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run GraphSAGE inference over a graph
    Run {
        /// Nodes in the synthetic graph
        #[arg(long, default_value = "10000")]
        nodes: usize,

        /// Average in-degree of the synthetic graph
        #[arg(long, default_value = "8")]
        avg_degree: usize,

        /// Load a `src dst` edge list instead of generating a graph
        #[arg(long)]
        edges: Option<PathBuf>,

        /// Feature widths: input, hidden..., output
        #[arg(long, value_delimiter = ',', default_value = "64,128,16")]
        dims: Vec<usize>,

        /// JSON inference configuration
        #[arg(short, long, env = "LAYERWISE_CONFIG")]
        config: Option<PathBuf>,

        /// Batching strategy: fixed, edge or auto
        #[arg(long)]
        strategy: Option<String>,

        /// Nodes per batch for the fixed strategy
        #[arg(long)]
        batch_size: Option<usize>,

        /// Memory capacity in bytes to account against
        #[arg(long)]
        memory_limit: Option<usize>,

        /// Random seed for the synthetic graph
        #[arg(long, default_value = "0")]
        seed: u64,

        /// GPU device ID (auto-detect if not specified)
        #[arg(long)]
        device: Option<usize>,
    },

    /// Show how the model is split into layers
    Inspect {
        /// Feature widths: input, hidden..., output
        #[arg(long, value_delimiter = ',', default_value = "64,128,16")]
        dims: Vec<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_layerwise=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            nodes,
            avg_degree,
            edges,
            dims,
            config,
            strategy,
            batch_size,
            memory_limit,
            seed,
            device,
        } => {
            let mut config = match config {
                Some(path) => InferenceConfig::from_file(path)?,
                None => InferenceConfig::default(),
            };
            if let Some(strategy) = strategy {
                config = config.with_strategy(strategy.parse::<StrategyKind>()?);
            }
            if let Some(batch_size) = batch_size {
                config = config.with_batch_size(batch_size);
            }
            if let Some(limit) = memory_limit {
                config = config.with_memory_limit(limit);
            }

            let graph = match edges {
                Some(path) => {
                    println!("Loading graph: {:?}", path);
                    CsrGraph::from_edge_list(path)?
                }
                None => CsrGraph::random(nodes, avg_degree, seed)?,
            };
            run(Arc::new(graph), &dims, &config, device)?;
        }

        Commands::Inspect { dims } => {
            inspect(&dims)?;
        }
    }

    Ok(())
}

fn run(
    graph: Arc<CsrGraph>,
    dims: &[usize],
    config: &InferenceConfig,
    device_id: Option<usize>,
) -> anyhow::Result<()> {
    let device = rs_layerwise::get_device(device_id)?;
    println!("Using device: {}", device_label(&device));
    println!(
        "Graph: {} nodes, {} edges",
        graph.num_nodes(),
        graph.num_edges()
    );

    let model = GraphSage::new(dims, &device)?;
    let features = candle_core::Tensor::randn(0f32, 1.0, (graph.num_nodes(), model.in_dim()), &device)?;

    let mut helper = InferenceHelper::from_config(&model, config, device)?;
    println!(
        "Model split into {} layers, strategy {:?}",
        helper.schema().layer_count(),
        config.strategy
    );

    let start = Instant::now();
    let output = helper.inference(&graph, vec![Value::Tensor(features)])?;
    let elapsed = start.elapsed();

    let output = output.as_tensor()?;
    println!("\nOutput shape: {:?}", output.dims());
    println!("Elapsed: {:.2?}", elapsed);
    println!("Peak memory: {}", format_bytes(helper.peak_memory() as u64));
    if let Some(max) = helper.strategy().max_memory() {
        println!("Max batch memory: {}", format_bytes(max as u64));
    }

    Ok(())
}

fn inspect(dims: &[usize]) -> anyhow::Result<()> {
    let model = GraphSage::new(dims, &candle_core::Device::Cpu)?;
    let generator = FunctionGenerator::compile(&model)?;

    println!("Traced graph");
    println!("============");
    println!("{}", generator.traced());

    for (l, graph) in generator.layer_graphs().iter().enumerate() {
        println!("Layer {}", l);
        println!("=======");
        println!("{}", graph);
    }

    println!("Schema");
    println!("======");
    println!("{}", generator.schema());

    Ok(())
}
