//! SpillGraph CLI - Inspect and maintain graph stores
//!
//! Commands:
//! - `stats` - Show node and edge counts of a store
//! - `verify` - Decode every record and report corrupt ones
//! - `show` - Print one node's properties and adjacency
//! - `reindex` - Rebuild all secondary indices

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use spillgraph_config::{ConfigLoader, ConfigOverrides, LogFormat, LoggingConfig, SpillConfig};
use spillgraph_core::{Direction, Graph, GraphStats, Schema};

/// SpillGraph - Property-graph store inspection
#[derive(Parser)]
#[command(name = "spillgraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Explicit configuration file (skips global/local lookup)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Store and schema locations shared by every command
#[derive(clap::Args)]
struct StoreArgs {
    /// Store file
    #[arg(short, long)]
    store: PathBuf,

    /// Schema file (JSON, or TOML with a .toml extension)
    #[arg(long)]
    schema: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node and edge counts per label
    Stats {
        #[command(flatten)]
        store: StoreArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode every record and report corrupt ones
    Verify {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Print a node's properties and adjacency
    Show {
        #[command(flatten)]
        store: StoreArgs,

        /// Node id
        id: i64,
    },

    /// Rebuild all secondary indices
    Reindex {
        #[command(flatten)]
        store: StoreArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = match &cli.command {
        Commands::Stats { store, .. }
        | Commands::Verify { store }
        | Commands::Show { store, .. }
        | Commands::Reindex { store } => store,
    };
    let config = load_config(cli.config.as_deref(), &store.store)?;

    // Setup logging
    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Stats { store, json } => cmd_stats(&store, &config, json),
        Commands::Verify { store } => cmd_verify(&store, &config),
        Commands::Show { store, id } => cmd_show(&store, &config, id),
        Commands::Reindex { store } => cmd_reindex(&store, &config),
    }
}

/// Merge config sources and point storage at the requested store
fn load_config(explicit: Option<&Path>, store: &Path) -> Result<SpillConfig> {
    let overrides = ConfigOverrides {
        location: Some(store.to_path_buf()),
        ..ConfigOverrides::default()
    };

    match explicit {
        Some(path) => {
            let mut config = ConfigLoader::new()
                .load_file(path)
                .with_context(|| format!("Failed to load config file {:?}", path))?;
            config.apply_overrides(&overrides);
            config.validate().context("Invalid configuration")?;
            Ok(config)
        }
        None => {
            let base_dir = store
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            ConfigLoader::new()
                .load(base_dir, Some(&overrides))
                .context("Failed to load configuration")
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        logging
            .level
            .parse::<Level>()
            .with_context(|| format!("Invalid log level '{}'", logging.level))?
    };

    match logging.format {
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn open_graph(args: &StoreArgs, config: &SpillConfig) -> Result<Graph> {
    if !args.store.exists() {
        anyhow::bail!("Store not found: {:?}", args.store);
    }
    let schema = Schema::load(&args.schema)
        .with_context(|| format!("Failed to load schema {:?}", args.schema))?;
    Graph::open(schema, config).with_context(|| format!("Failed to open store {:?}", args.store))
}

/// Statistics printed by `stats`
#[derive(Debug, Serialize)]
struct StoreReport {
    #[serde(flatten)]
    graph: GraphStats,
    edges_by_label: BTreeMap<String, u64>,
}

/// Show node and edge counts of a store
fn cmd_stats(args: &StoreArgs, config: &SpillConfig, json: bool) -> Result<()> {
    let graph = open_graph(args, config)?;
    let report = StoreReport {
        graph: graph.stats(),
        edges_by_label: graph
            .edge_counts_by_label()
            .context("Failed to count edges")?,
    };
    graph.close().context("Failed to close store")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\nStore Statistics");
    println!("================");
    println!();
    println!("Overview:");
    println!("  Store: {}", args.store.display());
    println!("  Total nodes: {}", report.graph.nodes);
    println!("  Total edges: {}", report.graph.edges);
    if !report.graph.indices.is_empty() {
        println!("  Indices: {}", report.graph.indices.join(", "));
    }

    println!();
    println!("Node Labels:");
    let mut labels: Vec<_> = report.graph.nodes_by_label.iter().collect();
    labels.sort_by(|a, b| b.1.cmp(a.1));
    for (label, count) in labels {
        println!("  {}: {}", label, count);
    }

    println!();
    println!("Edge Labels:");
    let mut labels: Vec<_> = report.edges_by_label.iter().collect();
    labels.sort_by(|a, b| b.1.cmp(a.1));
    for (label, count) in labels {
        println!("  {}: {}", label, count);
    }
    Ok(())
}

/// Decode every record and report corrupt ones
fn cmd_verify(args: &StoreArgs, config: &SpillConfig) -> Result<()> {
    let graph = open_graph(args, config)?;
    let report = graph.verify().context("Verification failed")?;
    graph.close().context("Failed to close store")?;

    println!("Checked {} records", report.records);
    for (id, reason) in &report.corrupt {
        println!("  corrupt node {}: {}", id, reason);
    }
    for id in &report.missing {
        println!("  missing record for node {}", id);
    }

    if !report.is_ok() {
        anyhow::bail!(
            "{} corrupt and {} missing records",
            report.corrupt.len(),
            report.missing.len()
        );
    }
    info!("Store is consistent");
    Ok(())
}

/// Print a node's properties and adjacency
fn cmd_show(args: &StoreArgs, config: &SpillConfig, id: i64) -> Result<()> {
    let graph = open_graph(args, config)?;
    let node = graph
        .node(id)
        .with_context(|| format!("Node {} not found", id))?;
    let label = node.label_name()?;

    println!("Node {} ({})", id, label);
    println!();
    println!("Properties:");
    for (key, value) in node.properties()? {
        println!("  {} = {}", key, value);
    }

    let layout = graph.schema().node_label(&label)?;
    for &(edge_label, direction) in layout.ranges() {
        let Some(edge) = graph.schema().edge_label(edge_label) else {
            continue;
        };
        let adjacent = node.adjacent(edge.name(), direction)?;
        if adjacent.is_empty() {
            continue;
        }
        let arrow = match direction {
            Direction::Out => "->",
            Direction::In => "<-",
        };
        println!();
        println!("{} ({}):", edge.name(), direction);
        for entry in adjacent {
            let properties: Vec<String> = entry
                .properties
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            println!("  {} {} [{}]", arrow, entry.neighbor, properties.join(", "));
        }
    }

    graph.close().context("Failed to close store")?;
    Ok(())
}

/// Rebuild all secondary indices
fn cmd_reindex(args: &StoreArgs, config: &SpillConfig) -> Result<()> {
    let graph = open_graph(args, config)?;
    let rebuilt = graph.rebuild_indices().context("Failed to rebuild indices")?;
    graph.close().context("Failed to close store")?;

    println!("Rebuilt {} indices", rebuilt);
    Ok(())
}
