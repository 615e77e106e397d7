// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Domain data model for the indexer: assets (ethscriptions), the append-only
//! event log, marketplace listings, bridge records and queue jobs.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Canonical identity of an ethscription: the hash of its originating
/// transaction.
pub type HashId = H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    L1,
    L2,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::L1 => "l1",
            Chain::L2 => "l2",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1" => Ok(Chain::L1),
            "l2" => Ok(Chain::L2),
            other => Err(format!("unknown chain '{}'", other)),
        }
    }
}

/// An indexed ethscription. Created exactly once on a creation event and
/// never deleted; `owner`/`prev_owner` mutate on accepted transfers and
/// `locked` toggles with bridge lock/unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ethscription {
    pub hash_id: HashId,
    /// Hex sha-256 of the content URI
    pub sha: String,
    pub slug: String,
    pub token_id: u64,
    pub creator: Address,
    pub owner: Address,
    pub prev_owner: Option<Address>,
    pub locked: bool,
    /// Block timestamp of the creation transaction
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Transferred,
    Offered,
    Bought,
    OfferWithdrawn,
    PointsChanged,
    Locked,
    Unlocked,
    BridgedIn,
    TransferredL2,
    BridgedOut,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Transferred => "transferred",
            EventKind::Offered => "offered",
            EventKind::Bought => "bought",
            EventKind::OfferWithdrawn => "offer_withdrawn",
            EventKind::PointsChanged => "points_changed",
            EventKind::Locked => "locked",
            EventKind::Unlocked => "unlocked",
            EventKind::BridgedIn => "bridged_in",
            EventKind::TransferredL2 => "transferred_l2",
            EventKind::BridgedOut => "bridged_out",
        }
    }
}

/// One row of the append-only audit log. `tx_id` is globally unique
/// (`{tx_hash}-{sub_index}`) which makes insertion idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub tx_id: String,
    pub kind: EventKind,
    pub hash_id: HashId,
    pub from: Address,
    pub to: Address,
    pub block_hash: H256,
    pub block_number: u64,
    pub tx_index: u64,
    pub tx_hash: H256,
    pub block_timestamp: u64,
    pub value: U256,
}

impl IndexedEvent {
    /// Stable unique id for an event within a transaction. `sub_index` is the
    /// log index for log-derived events, or the segment index for batch
    /// calldata transfers.
    pub fn make_tx_id(tx_hash: &H256, sub_index: u64) -> String {
        format!("{:#x}-{}", tx_hash, sub_index)
    }
}

/// An active sale offer. One row per asset; removed on purchase/withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub hash_id: HashId,
    pub listed_by: Address,
    pub min_value: U256,
    /// Private listings are only buyable by this address
    pub to_address: Option<Address>,
    pub tx_hash: H256,
    pub listed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Unlocked,
    QueuedForMint,
    MintedL2,
    QueuedForBurn,
    BridgedOut,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Unlocked => "unlocked",
            BridgeState::QueuedForMint => "queued_for_mint",
            BridgeState::MintedL2 => "minted_l2",
            BridgeState::QueuedForBurn => "queued_for_burn",
            BridgeState::BridgedOut => "bridged_out",
        }
    }
}

/// Per-asset bridge lifecycle record, keyed by `hash_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub hash_id: HashId,
    pub state: BridgeState,
    /// Owner on L1 at lock time
    pub l1_owner: Address,
    /// Last observed owner of the L2 representation
    pub l2_owner: Option<Address>,
    pub nonce: u64,
    pub updated_at_block: u64,
}

impl BridgeRecord {
    pub fn new(hash_id: HashId, l1_owner: Address) -> Self {
        Self {
            hash_id,
            state: BridgeState::Unlocked,
            l1_owner,
            l2_owner: None,
            nonce: 0,
            updated_at_block: 0,
        }
    }
}

/// A pending L2 mint for a locked asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintJob {
    pub hash_id: HashId,
    pub owner: Address,
    pub attempts: u32,
}

/// One job per block number in the block queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: String,
    pub block_num: u64,
    pub chain: Chain,
    pub timestamp: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueueJob {
    pub fn new(chain: Chain, block_num: u64, timestamp: u64, max_retries: u32) -> Self {
        Self {
            job_id: format!("block_{}", block_num),
            block_num,
            chain,
            timestamp,
            retry_count: 0,
            max_retries,
        }
    }
}

/// Last fully processed block per chain. Read at startup to resume from
/// `block_number - safety_margin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCheckpoint {
    pub chain: Chain,
    pub block_number: u64,
    pub timestamp: u64,
}

/// Pre-registered collection content. Only inputs whose content sha appears
/// here can create an ethscription, and the registered attributes feed the L2
/// mint metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionItem {
    pub sha: String,
    pub slug: String,
    pub token_id: u64,
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}
