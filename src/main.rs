// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use ethscriptions_indexer::config::IndexerNodeConfig;
use ethscriptions_indexer::node::run_indexer_node;
use prometheus::Registry;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = IndexerNodeConfig::load(&args.config_path)?;
    info!("starting indexer (admin port {})", config.server_listen_port);

    let registry = Registry::new();
    let handle = run_indexer_node(config, registry).await?;
    handle
        .await
        .map_err(|e| anyhow::anyhow!("task join error: {}", e))
}
