//! gatsby CLI - train graph attention networks on node classification graphs.
//!
//! # Usage
//!
//! ```bash
//! # Generate a synthetic benchmark graph
//! gatsby generate toy.json --nodes 2000 --classes 8
//!
//! # Inspect a graph
//! gatsby stats toy.json
//!
//! # Full-graph training
//! gatsby train toy.json --epochs 200 --num-heads 4 --report run.json
//!
//! # Neighbor-sampled training
//! gatsby train toy.json --mode mini-batch --fanouts 5,10,15 --batch-size 512
//!
//! # Run queued hyperparameter suggestions
//! gatsby search toy.json --suggestions trials.json --results results.json
//! ```

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand, ValueEnum};
use gatsby_core::synthetic::{planted_partition, SyntheticConfig};
use gatsby_core::{parse_fanouts, Graph};
use gatsby_nn::{Activation, Norm};
use gatsby_train::{
    run_search, Monitor, QueueSuggestions, Trainer, TrainingConfig, TrainingMode, TrainingReport,
    TrialStatus,
};
use indicatif::ProgressBar;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatsby")]
#[command(about = "Graph attention network training CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a GAT and report per-epoch metrics
    Train {
        #[command(flatten)]
        graph: GraphArgs,

        #[command(flatten)]
        train: TrainArgs,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Write the final parameters as safetensors
        #[arg(long)]
        save_params: Option<PathBuf>,
    },

    /// Train once per queued hyperparameter suggestion
    Search {
        #[command(flatten)]
        graph: GraphArgs,

        #[command(flatten)]
        train: TrainArgs,

        /// JSON array of assignment objects
        #[arg(long)]
        suggestions: PathBuf,

        /// Write every trial outcome as JSON
        #[arg(long)]
        results: Option<PathBuf>,

        /// Stop after this many trials
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Show statistics about a graph file
    Stats {
        #[command(flatten)]
        graph: GraphArgs,
    },

    /// Write a synthetic planted-partition graph (.json or .bin)
    Generate {
        /// Output file
        output: PathBuf,

        #[arg(long, default_value = "200")]
        nodes: usize,

        #[arg(long, default_value = "4")]
        classes: usize,

        #[arg(long, default_value = "16")]
        feature_dim: usize,

        /// Out-edges drawn per node
        #[arg(long, default_value = "5")]
        avg_degree: usize,

        /// Probability an edge stays inside its class
        #[arg(long, default_value = "0.8")]
        homophily: f64,

        /// Width of edge features (0 = none)
        #[arg(long, default_value = "0")]
        edge_feature_dim: usize,

        /// One binary task per class instead of class ids
        #[arg(long)]
        multi_label: bool,

        #[arg(long, default_value = "13")]
        seed: u64,
    },
}

#[derive(Args)]
struct GraphArgs {
    /// Graph file (.json or .bin)
    input: PathBuf,

    /// Add a reversed copy of every edge
    #[arg(long)]
    reverse_edges: bool,

    /// Replace self loops with exactly one per node
    #[arg(long)]
    self_loop: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// One step per epoch over the whole graph
    FullGraph,
    /// One step per batch of sampled blocks
    MiniBatch,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    /// First CUDA device when built with `cuda` and one is present, else CPU
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceArg {
    fn device(self) -> Result<Device> {
        let device = match self {
            Self::Auto => Device::cuda_if_available(0)?,
            Self::Cpu => Device::Cpu,
            Self::Cuda => Device::new_cuda(0).context("CUDA device unavailable (built without the `cuda` feature?)")?,
            Self::Metal => Device::new_metal(0).context("Metal device unavailable (built without the `metal` feature?)")?,
        };
        Ok(device)
    }
}

/// Training flags. Unset flags keep the value from `--config` or the default.
#[derive(Args)]
struct TrainArgs {
    /// Compute device
    #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
    device: DeviceArg,

    /// Base configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    #[arg(long)]
    node_hidden_feats: Option<usize>,

    #[arg(long)]
    edge_hidden_feats: Option<usize>,

    #[arg(long)]
    num_heads: Option<usize>,

    #[arg(long)]
    num_layers: Option<usize>,

    /// none, left, right or both
    #[arg(long, value_parser = parse_norm)]
    norm: Option<Norm>,

    #[arg(long)]
    batch_norm: Option<bool>,

    #[arg(long)]
    input_dropout: Option<f32>,

    #[arg(long)]
    attn_dropout: Option<f32>,

    #[arg(long)]
    edge_dropout: Option<f32>,

    #[arg(long)]
    dropout: Option<f32>,

    #[arg(long)]
    negative_slope: Option<f64>,

    #[arg(long)]
    residual: Option<bool>,

    /// relu or leaky_relu
    #[arg(long, value_parser = parse_activation)]
    activation: Option<Activation>,

    #[arg(long)]
    use_attn_dst: Option<bool>,

    #[arg(long)]
    bias: Option<bool>,

    /// Mini-batch mode only
    #[arg(long)]
    batch_size: Option<usize>,

    /// Comma separated, one per layer, -1 = full neighborhood (mini-batch mode only)
    #[arg(long)]
    fanouts: Option<String>,

    /// Sampling threads (mini-batch mode only)
    #[arg(long)]
    num_workers: Option<usize>,

    /// Epochs without improvement before stopping
    #[arg(long)]
    patience: Option<usize>,

    /// loss or score
    #[arg(long, value_parser = parse_monitor)]
    monitor: Option<Monitor>,

    /// Wall-clock limit in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Skip the test split evaluation
    #[arg(long)]
    no_test: bool,

    #[arg(long)]
    seed: Option<u64>,
}

fn parse_norm(s: &str) -> std::result::Result<Norm, String> {
    s.parse().map_err(|e: gatsby_nn::Error| e.to_string())
}

fn parse_activation(s: &str) -> std::result::Result<Activation, String> {
    s.parse().map_err(|e: gatsby_nn::Error| e.to_string())
}

fn parse_monitor(s: &str) -> std::result::Result<Monitor, String> {
    s.parse().map_err(|e: gatsby_train::Error| e.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            graph,
            train,
            report,
            save_params,
        } => cmd_train(&graph, &train, report.as_deref(), save_params.as_deref()),
        Commands::Search {
            graph,
            train,
            suggestions,
            results,
            budget,
        } => cmd_search(&graph, &train, &suggestions, results.as_deref(), budget),
        Commands::Stats { graph } => cmd_stats(&graph),
        Commands::Generate {
            output,
            nodes,
            classes,
            feature_dim,
            avg_degree,
            homophily,
            edge_feature_dim,
            multi_label,
            seed,
        } => {
            let config = SyntheticConfig {
                avg_degree,
                homophily,
                ..SyntheticConfig::default()
            }
            .with_num_nodes(nodes)
            .with_num_classes(classes)
            .with_feature_dim(feature_dim)
            .with_edge_feature_dim(edge_feature_dim)
            .with_multi_label(multi_label)
            .with_seed(seed);
            cmd_generate(&output, &config)
        }
    }
}

fn load_graph(args: &GraphArgs) -> Result<Graph> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", args.input.display()));

    let mut graph = Graph::load(&args.input)
        .with_context(|| format!("Failed to load graph {}", args.input.display()))?;
    if args.reverse_edges {
        graph = graph.with_reverse_edges().context("Failed to add reverse edges")?;
    }
    if args.self_loop {
        graph = graph.with_self_loops().context("Failed to add self loops")?;
    }

    pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));
    tracing::info!(
        path = %args.input.display(),
        nodes = graph.num_nodes(),
        edges = graph.stats().num_edges,
        "graph loaded"
    );
    Ok(graph)
}

/// Defaults, then `--config`, then individual flags.
fn build_config(args: &TrainArgs) -> Result<TrainingConfig> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_json_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => TrainingConfig::default(),
    };

    match args.mode {
        Some(ModeArg::FullGraph) => config.mode = TrainingMode::FullGraph,
        Some(ModeArg::MiniBatch) if config.mode == TrainingMode::FullGraph => {
            config.mode = TrainingMode::mini_batch();
        }
        _ => {}
    }
    match &mut config.mode {
        TrainingMode::MiniBatch {
            batch_size,
            fanouts,
            num_workers,
        } => {
            if let Some(v) = args.batch_size {
                *batch_size = v;
            }
            if let Some(v) = &args.fanouts {
                *fanouts = parse_fanouts(v).with_context(|| format!("Bad --fanouts '{v}'"))?;
            }
            if let Some(v) = args.num_workers {
                *num_workers = v;
            }
        }
        TrainingMode::FullGraph => {
            if args.batch_size.is_some() || args.fanouts.is_some() || args.num_workers.is_some() {
                bail!("--batch-size, --fanouts and --num-workers require --mode mini-batch");
            }
        }
    }

    let model = &mut config.model;
    set(&mut model.node_hidden_feats, args.node_hidden_feats);
    set(&mut model.edge_hidden_feats, args.edge_hidden_feats);
    set(&mut model.num_heads, args.num_heads);
    set(&mut model.num_layers, args.num_layers);
    set(&mut model.norm, args.norm);
    set(&mut model.batch_norm, args.batch_norm);
    set(&mut model.input_dropout, args.input_dropout);
    set(&mut model.attn_dropout, args.attn_dropout);
    set(&mut model.edge_dropout, args.edge_dropout);
    set(&mut model.dropout, args.dropout);
    set(&mut model.negative_slope, args.negative_slope);
    set(&mut model.residual, args.residual);
    set(&mut model.activation, args.activation);
    set(&mut model.use_attn_dst, args.use_attn_dst);
    set(&mut model.bias, args.bias);

    set(&mut config.epochs, args.epochs);
    set(&mut config.learning_rate, args.lr);
    set(&mut config.weight_decay, args.weight_decay);
    set(&mut config.patience, args.patience);
    set(&mut config.monitor, args.monitor);
    set(&mut config.seed, args.seed);
    if args.timeout.is_some() {
        config.timeout_secs = args.timeout;
    }
    if args.no_test {
        config.evaluate_test = false;
    }
    Ok(config)
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

fn print_report(report: &TrainingReport) {
    println!("Training Summary");
    println!("================");
    println!("Outcome:     {:?}", report.outcome);
    println!("Epochs run:  {}", report.epochs.len());
    println!("Monitor:     {}", report.monitor);
    if let Some(best) = &report.best {
        println!("Best epoch:  {}", best.epoch);
        println!("Valid loss:  {:.4}", best.valid_loss);
        println!("Valid {}: {:.4}", report.evaluator, best.valid_score);
    }
    if let Some(test) = &report.test {
        println!("Test loss:   {:.4}", test.loss);
        println!("Test {}:  {:.4}", report.evaluator, test.score);
    }
    println!("Total time:  {:.2}s", report.total_time);
}

fn cmd_train(
    graph_args: &GraphArgs,
    train_args: &TrainArgs,
    report_path: Option<&Path>,
    params_path: Option<&Path>,
) -> Result<()> {
    let config = build_config(train_args)?;
    let device = train_args.device.device()?;
    let graph = Arc::new(load_graph(graph_args)?);

    tracing::info!(device = ?device, "training");
    let run = Trainer::new(config)
        .with_device(device)
        .fit(graph)
        .context("Training failed")?;
    print_report(&run.report);

    if let Some(path) = report_path {
        write_json(path, &run.report)?;
        println!("Report written to {}", path.display());
    }
    if let Some(path) = params_path {
        run.save_parameters(path)
            .with_context(|| format!("Failed to save parameters to {}", path.display()))?;
        println!("Parameters written to {}", path.display());
    }
    Ok(())
}

fn cmd_search(
    graph_args: &GraphArgs,
    train_args: &TrainArgs,
    suggestions: &Path,
    results: Option<&Path>,
    budget: Option<usize>,
) -> Result<()> {
    let base = build_config(train_args)?;
    let graph = Arc::new(load_graph(graph_args)?);
    let mut source = QueueSuggestions::from_json_file(suggestions)
        .with_context(|| format!("Failed to read suggestions {}", suggestions.display()))?;

    let device = train_args.device.device()?;
    tracing::info!(device = ?device, trials = source.remaining(), "starting search");

    let outcomes = run_search(&mut source, &base, graph, budget, &device).context("Search aborted")?;

    println!("{:<6} {:<10} {:>12} {:>12}", "trial", "status", "best valid", "test");
    for outcome in &outcomes {
        let status = match &outcome.status {
            TrialStatus::Completed => "completed",
            TrialStatus::Failed { .. } => "failed",
        };
        let valid = outcome
            .best_valid_score()
            .map_or_else(|| "-".to_string(), |s| format!("{s:.4}"));
        let test = outcome
            .report
            .as_ref()
            .and_then(|r| r.test.as_ref())
            .map_or_else(|| "-".to_string(), |t| format!("{:.4}", t.score));
        println!("{:<6} {:<10} {:>12} {:>12}", outcome.suggestion.id, status, valid, test);
        if let TrialStatus::Failed { message } = &outcome.status {
            println!("       {message}");
        }
    }

    if let Some(path) = results {
        write_json(path, &outcomes)?;
        println!("Results written to {}", path.display());
    }
    Ok(())
}

fn cmd_stats(graph_args: &GraphArgs) -> Result<()> {
    let stats = load_graph(graph_args)?.stats();

    let labels = match (stats.num_outputs, stats.multi_label) {
        (None, _) => "none".to_string(),
        (Some(n), true) => format!("{n} binary tasks"),
        (Some(n), false) => format!("{n} classes"),
    };
    let edge_dim = stats
        .edge_feature_dim
        .map_or_else(|| "none".to_string(), |d| d.to_string());

    println!("Graph Statistics");
    println!("================");
    println!("Nodes:          {}", stats.num_nodes);
    println!("Edges:          {}", stats.num_edges);
    println!("Node features:  {}", stats.node_feature_dim);
    println!("Edge features:  {edge_dim}");
    println!("Labels:         {labels}");
    println!(
        "Splits:         {} / {} / {}",
        stats.train_size, stats.valid_size, stats.test_size
    );
    println!("Zero in-degree: {}", stats.zero_in_degree);
    println!("Self loops:     {}", stats.self_loops);
    println!("Mean in-degree: {:.2}", stats.mean_in_degree);
    Ok(())
}

fn cmd_generate(output: &Path, config: &SyntheticConfig) -> Result<()> {
    let start = Instant::now();
    let graph = planted_partition(config).context("Failed to generate graph")?;
    graph
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Generated {} nodes, {} edges -> {} in {:.2?}",
        graph.num_nodes(),
        graph.stats().num_edges,
        output.display(),
        start.elapsed()
    );
    Ok(())
}
