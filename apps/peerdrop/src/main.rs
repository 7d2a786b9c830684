//! peerdrop command line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerdrop", author, version, about = "Resumable peer-to-peer file transfer")]
struct Cli {
    /// Configuration file (defaults to the XDG config location).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cached transfers with their progress.
    List,

    /// Delete a cached transfer and its merged file.
    Evict {
        /// Transfer id.
        id: String,
    },

    /// Send a file to an in-process peer and print where it landed.
    Loopback {
        file: PathBuf,

        /// Parallel channels (overrides the configuration).
        #[arg(short = 'n', long)]
        channels: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting peerdrop");

    let mut config = config::Config::load(cli.config.as_deref())?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::List => rt.block_on(app::list(&config)),
        Command::Evict { id } => rt.block_on(app::evict(&config, &id)),
        Command::Loopback { file, channels } => {
            if let Some(n) = channels {
                anyhow::ensure!(n > 0, "channels must be at least 1");
                config.channels = n;
            }
            rt.block_on(app::loopback(&config, &file))
        }
    }
}
