mod agent;
mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use testpilot_core::{Config, HttpEmbedder, SqliteIndex};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::session::GeminiBackends;

#[derive(Parser)]
#[command(name = "testpilot-worker")]
#[command(about = "Model and tool worker for testpilot", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the envelope protocol on stdin/stdout (default)
    Serve,
    /// Embed the Go sources under a directory into the similarity store
    Index {
        /// Directory to scan recursively
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::load().context("Failed to load configuration")?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!(root = %config.resolve_work_dir().display(), "Worker starting");
            session::serve(
                config,
                Arc::new(GeminiBackends),
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
        }
        Commands::Index { dir } => index(&config, &dir).await,
    }
}

async fn index(config: &Config, dir: &Path) -> Result<()> {
    let embedder = HttpEmbedder::from_config(config)?;
    let store = SqliteIndex::from_config(config)?;

    let count = store
        .index_directory(dir, &embedder)
        .await
        .with_context(|| format!("Failed to index {}", dir.display()))?;

    println!("Indexed {} chunks from {}", count, dir.display());
    Ok(())
}
