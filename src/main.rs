//! Ontograph CLI entry point

use clap::{Parser, Subcommand};
use ontograph_core::DagConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "ontograph")]
#[command(about = "Maintenance tool for an ontograph knowledge store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Snapshot directory (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store size, id counters and active modules
    Stats,
    /// Assert an edge such as `(isa Cow Mammal)`, creating nodes as needed
    Assert {
        edge: String,

        /// Store the edge provisionally until the next `ground`
        #[arg(long)]
        ephemeral: bool,
    },
    /// List the edges touching a node
    Query {
        /// Node name or id
        node: String,

        /// 1-based argument position; negative excludes that position
        #[arg(short, long, allow_hyphen_values = true)]
        position: Option<i32>,
    },
    /// Find nodes by name or alias
    Lookup {
        alias: String,

        #[arg(short, long)]
        ignore_case: bool,

        /// Match every alias starting with the given text
        #[arg(short, long)]
        prefix: bool,
    },
    /// Remove a node and every edge referencing it
    Remove {
        /// Node name or id
        node: String,
    },
    /// Make every ephemeral edge permanent
    Ground,
    /// Show version
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "ontograph={0},ontograph_core={0}",
            log_level
        )))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &cli.config {
        Some(path) => DagConfig::from_file(path)?,
        None => DagConfig::default(),
    };
    config.root = Some(cli.root.clone());
    tracing::debug!("Store root: {}", cli.root.display());

    match cli.command {
        Commands::Stats => commands::stats(config),
        Commands::Assert { edge, ephemeral } => commands::assert(config, &edge, ephemeral),
        Commands::Query { node, position } => commands::query(config, &node, position),
        Commands::Lookup {
            alias,
            ignore_case,
            prefix,
        } => commands::lookup(config, &alias, ignore_case, prefix),
        Commands::Remove { node } => commands::remove(config, &node),
        Commands::Ground => commands::ground(config),
        Commands::Version => {
            println!("Ontograph v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
