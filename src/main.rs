use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weavemesh::{FabricConfig, FabricNode};

/// Domain-scoped peer-to-peer compute fabric node
#[derive(Debug, Parser)]
#[command(name = "weavemesh", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "WEAVEMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `weavemesh=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => FabricConfig::from_file(path)?,
        None => FabricConfig::from_env(),
    };
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }

    let node = FabricNode::start(config).await?;
    info!(node = %node.node_id(), "weavemesh running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown();
    // Give loops one polling tick to observe the signal.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    Ok(())
}
