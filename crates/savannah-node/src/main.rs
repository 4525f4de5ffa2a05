//! Savannah node binary.
//!
//! Runs one chain through bootstrapping into Snowman consensus on a
//! single-node loopback network.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use savannah_utils::logging::{self, LogLevel};
use tracing::{error, info};

mod config;
mod network;
mod node;
mod vm;

use config::NodeConfig;
use node::Node;

/// Savannah node CLI
#[derive(Parser)]
#[command(name = "savannah-node")]
#[command(version)]
#[command(about = "Snow consensus node", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Stop once a block at this height is accepted
    #[arg(long)]
    stop_height: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,
    /// Write a default configuration file
    Init,
    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::Init) = cli.command {
        NodeConfig::default().save(&cli.config)?;
        println!("configuration written to {}", cli.config.display());
        return Ok(());
    }

    let mut config = if cli.config.exists() {
        NodeConfig::load(&cli.config)?
    } else {
        NodeConfig::default()
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if cli.stop_height.is_some() {
        config.chain.stop_height = cli.stop_height;
    }
    logging::try_init(&config.logging)?;

    match cli.command {
        Some(Commands::Validate) => {
            if let Err(e) = config.validate() {
                error!("configuration invalid: {e}");
                std::process::exit(1);
            }
            info!(config = ?cli.config, "configuration is valid");
        }
        Some(Commands::Start) | Some(Commands::Init) | None => {
            info!(data_dir = ?config.data_dir, chain = %config.chain.name, "starting node");
            let node = Node::new(config).await?;
            info!(node_id = %node.node_id(), "node initialized");
            let vm = node.vm();
            if let Err(e) = node.run().await {
                error!("node error: {e}");
                std::process::exit(1);
            }
            info!(height = vm.last_accepted_height(), state = ?vm.state(), "final chain state");
        }
    }

    Ok(())
}
