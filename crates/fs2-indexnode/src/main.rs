#![warn(missing_docs)]

//! FS2 indexnode server binary.

use anyhow::Result;
use clap::Parser;
use fs2_indexnode::{IndexNode, IndexnodeApi, IndexnodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// FS2 indexnode: registers clients and indexes their shares.
#[derive(Debug, Parser)]
#[command(name = "fs2-indexnode", version, about)]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(long, short, env = "FS2_INDEXNODE_CONFIG", default_value = "/etc/fs2/indexnode.toml")]
    config: PathBuf,

    /// Overrides the listen address from the configuration.
    #[arg(long, env = "FS2_INDEXNODE_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        IndexnodeConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        IndexnodeConfig::default()
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let node = IndexNode::from_config(config)?;
    node.start();

    let api = IndexnodeApi::new(node.clone());
    let served = api
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for shutdown signal: {}", e);
            }
        })
        .await;

    node.shutdown().await;
    served
}
