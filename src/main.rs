//! Command-line driver for the stage allocation search.
//!
//! ```bash
//! dpstage search --graph ./model.json --config ./cluster.toml -vv
//! dpstage search --graph ./model.json --node-profiles ./profiles.json --exhaustive
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dpstage::{DpStaging, Graph, SearchConfig, SearchError};

#[derive(Parser)]
#[command(name = "dpstage", about = "Pipeline stage and device allocation search for distributed training", version)]
struct Cli {
    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the best stage layout of a model graph with the analytic cost model.
    Search {
        /// JSON description of the node sequence.
        #[arg(short, long)]
        graph: PathBuf,

        /// TOML search configuration; defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write per-node profiles to this path before searching.
        #[arg(long)]
        node_profiles: Option<PathBuf>,

        /// Keep searching larger device groups after a solution is found.
        #[arg(long)]
        exhaustive: bool,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn search(graph: PathBuf, config: Option<PathBuf>, node_profiles: Option<PathBuf>, exhaustive: bool) -> Result<(), SearchError> {
    let mut config = match config {
        Some(path) => SearchConfig::from_file(&path)?,
        None => SearchConfig::default(),
    };
    if node_profiles.is_some() {
        config.dump_node_profiles = node_profiles;
    }
    config.exhaustive_search |= exhaustive;

    let content = std::fs::read_to_string(&graph).map_err(|e| SearchError::Io { path: graph.clone(), source: e })?;
    let graph = Graph::from_json(&content)?;

    let oracle = config.cluster.computation.clone();
    let comm = config.cluster.communication.clone();
    let mut staging = DpStaging::new(&graph, &config, &oracle, &comm);
    let sol = staging.run()?;

    println!("stages: {}, pipeline_num: {}, checkpointing: {}", sol.stage_num(), sol.pipeline_num, sol.checkpointing);
    for i in 0..sol.stage_num() {
        let names: Vec<_> = (sol.boundaries[i]..sol.boundaries[i + 1]).map(|n| graph.nodes[n].name.as_str()).collect();
        println!("  stage {i}: {} devices, nodes [{}]", sol.repl_num(i), names.join(", "));
    }
    println!("estimated step time: {:.6}s", staging.estimate_time(&sol));
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = ctrlc::set_handler(|| {
        warn!("interrupted");
        std::process::exit(130)
    }) {
        warn!("failed to trap Ctrl-C: {e}");
    }

    let result = match cli.command {
        Commands::Search { graph, config, node_profiles, exhaustive } => search(graph, config, node_profiles, exhaustive),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1)
    }
}
