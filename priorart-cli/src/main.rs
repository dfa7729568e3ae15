//! priorart CLI: run the prior-art retrieval pipeline for one idea.
//!
//! Loads a JSON-lines corpus into an in-memory index, runs search, grading
//! and reranking, and prints the ranked documents as JSON.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// priorart: hybrid prior-art retrieval with grading and reranking
#[derive(Parser, Debug)]
#[command(name = "priorart", version, about, long_about = None)]
struct Cli {
    /// Idea description to search prior art for
    idea: Option<String>,

    /// JSON-lines corpus file (one document per line)
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Dense search only (no sparse signal, no RRF)
    #[arg(long)]
    dense_only: bool,

    /// Results per query; up to twice this many are graded
    #[arg(long)]
    top_k: Option<usize>,

    /// Classification-code prefix filter (repeatable), e.g. --category B64U
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Print every graded result instead of the reranked top
    #[arg(long)]
    graded: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn,priorart_core=info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "priorart", "priorart")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "priorart.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Some(Commands::Config { action }) = cli.command {
        return commands::handle_config(action, &workspace);
    }

    let Some(idea) = cli.idea else {
        anyhow::bail!("no idea given; run `priorart --help` for usage");
    };
    let Some(corpus) = cli.corpus else {
        anyhow::bail!("--corpus <FILE> is required to search");
    };

    let options = commands::SearchOptions {
        idea,
        corpus,
        dense_only: cli.dense_only,
        top_k: cli.top_k,
        categories: cli.categories,
        graded: cli.graded,
    };
    commands::run_search(options, &workspace).await
}
