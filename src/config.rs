// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{IndexerError, IndexerResult};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::{Path, PathBuf};

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct L1Config {
    // Rpc url for the L1 fullnode
    pub rpc_url: String,
    // The expected chain id on the L1 side, validated against the endpoint
    pub chain_id: u64,
    // First block of the collection; backfill never starts earlier
    pub start_block: u64,
    #[serde(default = "default_l1_poll_interval_ms")]
    pub poll_interval_ms: u64,
    // The marketplace contract whose Offered/Bought/NoLongerForSale logs are indexed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketplace_address: Option<Address>,
    // The points contract; totals are re-read from it on every points log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_address: Option<Address>,
    // The bridge contract emitting HashLocked/HashUnlocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_address: Option<Address>,
    // The ethscriptions registry used by the consensus checker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_address: Option<Address>,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct L2Config {
    // Rpc url for the L2 fullnode, used for queries and mint submission
    pub rpc_url: String,
    // The expected chain id on the L2 side
    pub chain_id: u64,
    pub start_block: u64,
    #[serde(default = "default_l2_poll_interval_ms")]
    pub poll_interval_ms: u64,
    // The bridged collection contract (BridgedIn/Transfer/BridgedOut, mintBridged)
    pub collection_address: Address,
    // Path of the file where the relayer private key (hex) is stored
    pub relayer_key_path: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    // Blocks re-processed before the checkpoint on restart
    #[serde(default = "default_safety_margin")]
    pub safety_margin: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            safety_margin: default_safety_margin(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MintConfig {
    // Delay between consecutive mint submissions from the relayer key
    #[serde(default = "default_mint_pace_ms")]
    pub pace_ms: u64,
    #[serde(default = "default_mint_max_attempts")]
    pub max_attempts: u32,
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            pace_ms: default_mint_pace_ms(),
            max_attempts: default_mint_max_attempts(),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerNodeConfig {
    // The port that the admin/metrics server listens on
    #[serde(default = "default_server_listen_port")]
    pub server_listen_port: u16,
    pub l1: L1Config,
    // L2 is optional; without it the node indexes L1 only and never mints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2: Option<L2Config>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub mint: MintConfig,
    #[serde(default = "default_consensus_interval_secs")]
    pub consensus_interval_secs: u64,
    // JSON file with the collection allow-list (sha, slug, token-id, name, attributes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_path: Option<PathBuf>,
    // Delay before the whole pipeline restarts after a fatal error
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

fn default_server_listen_port() -> u16 {
    9184
}

fn default_l1_poll_interval_ms() -> u64 {
    12_000
}

fn default_l2_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_base_delay_ms() -> u64 {
    5_000
}

fn default_safety_margin() -> u64 {
    16
}

fn default_mint_pace_ms() -> u64 {
    2_000
}

fn default_mint_max_attempts() -> u32 {
    5
}

fn default_consensus_interval_secs() -> u64 {
    3_600
}

fn default_restart_delay_secs() -> u64 {
    10
}

impl IndexerNodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IndexerResult<()> {
        if self.l1.rpc_url.is_empty() {
            return Err(IndexerError::InvalidConfig("l1 rpc-url is empty".to_string()));
        }
        if self.mint.pace_ms == 0 {
            return Err(IndexerError::InvalidConfig(
                "mint pace-ms must be positive".to_string(),
            ));
        }
        if self.queue.max_retries == 0 {
            return Err(IndexerError::InvalidConfig(
                "queue max-retries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
