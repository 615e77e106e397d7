// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Recognized event signatures and log decoding.
//!
//! The topic constants below are part of the external on-chain contract: the
//! ESIP1/ESIP2 transfer signatures, the marketplace events, the L1 bridge
//! lock/unlock events and the L2 collection events. Decoding yields typed,
//! sanitized structs; unknown topics simply decode to `None`.

use crate::error::{IndexerError, IndexerResult};
use crate::types::HashId;
use ethers::abi::{decode, ParamType};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

// ESIP1: emitted by a contract that owns an ethscription to transfer it
pub static TRANSFER_ETHSCRIPTION_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("ethscriptions_protocol_TransferEthscription(address,bytes32)"));

// ESIP2: like ESIP1 but declares the previous owner for a stricter match
pub static TRANSFER_ETHSCRIPTION_FOR_PREVIOUS_OWNER_TOPIC: Lazy<H256> = Lazy::new(|| {
    event_topic("ethscriptions_protocol_TransferEthscriptionForPreviousOwner(address,address,bytes32)")
});

pub static PHUNK_OFFERED_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("PhunkOffered(bytes32,uint256,address)"));
pub static PHUNK_BOUGHT_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("PhunkBought(bytes32,uint256,address,address)"));
pub static PHUNK_NO_LONGER_FOR_SALE_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("PhunkNoLongerForSale(bytes32)"));

pub static HASH_LOCKED_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("HashLocked(bytes32,address,uint256,uint256)"));
pub static HASH_UNLOCKED_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("HashUnlocked(bytes32,address)"));

pub static BRIDGED_IN_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("BridgedIn(bytes32,address,uint256)"));
pub static ERC721_TRANSFER_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("Transfer(address,address,uint256)"));
pub static BRIDGED_OUT_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("BridgedOut(bytes32,address)"));

pub static POINTS_ADDED_TOPIC: Lazy<H256> =
    Lazy::new(|| event_topic("PointsAdded(address,uint256)"));

/// Contract-emitted ethscription transfer (ESIP1/ESIP2). The emitter is the
/// transferring party in both variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsipTransfer {
    V1 {
        recipient: Address,
        hash_id: HashId,
    },
    V2 {
        prev_owner: Address,
        recipient: Address,
        hash_id: HashId,
    },
}

impl EsipTransfer {
    pub fn recipient(&self) -> Address {
        match self {
            EsipTransfer::V1 { recipient, .. } => *recipient,
            EsipTransfer::V2 { recipient, .. } => *recipient,
        }
    }

    pub fn hash_id(&self) -> HashId {
        match self {
            EsipTransfer::V1 { hash_id, .. } => *hash_id,
            EsipTransfer::V2 { hash_id, .. } => *hash_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketplaceEvent {
    Offered {
        hash_id: HashId,
        min_value: U256,
        /// Zero address means an open listing
        to_address: Option<Address>,
    },
    Bought {
        hash_id: HashId,
        value: U256,
        from_address: Address,
        to_address: Address,
    },
    NoLongerForSale {
        hash_id: HashId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeL1Event {
    HashLocked {
        hash_id: HashId,
        prev_owner: Address,
        nonce: u64,
        value: U256,
    },
    HashUnlocked {
        hash_id: HashId,
        prev_owner: Address,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeL2Event {
    BridgedIn {
        hash_id: HashId,
        owner: Address,
        token_id: U256,
    },
    Transfer {
        from: Address,
        to: Address,
        token_id: U256,
    },
    BridgedOut {
        hash_id: HashId,
        owner: Address,
    },
}

fn address_from_topic(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

fn topic_at(log: &Log, index: usize) -> IndexerResult<H256> {
    log.topics.get(index).copied().ok_or_else(|| {
        IndexerError::AbiDecodeError(format!(
            "log from {:?} is missing topic {}",
            log.address, index
        ))
    })
}

fn decode_data(log: &Log, params: &[ParamType]) -> IndexerResult<Vec<ethers::abi::Token>> {
    decode(params, &log.data).map_err(|e| {
        IndexerError::AbiDecodeError(format!(
            "failed to decode log data from {:?}: {}",
            log.address, e
        ))
    })
}

pub fn decode_esip_transfer(log: &Log) -> IndexerResult<Option<EsipTransfer>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == *TRANSFER_ETHSCRIPTION_TOPIC {
        let recipient = address_from_topic(&topic_at(log, 1)?);
        let hash_id = topic_at(log, 2)?;
        return Ok(Some(EsipTransfer::V1 { recipient, hash_id }));
    }
    if *topic0 == *TRANSFER_ETHSCRIPTION_FOR_PREVIOUS_OWNER_TOPIC {
        let prev_owner = address_from_topic(&topic_at(log, 1)?);
        let recipient = address_from_topic(&topic_at(log, 2)?);
        let hash_id = topic_at(log, 3)?;
        return Ok(Some(EsipTransfer::V2 {
            prev_owner,
            recipient,
            hash_id,
        }));
    }
    Ok(None)
}

pub fn decode_marketplace_event(log: &Log) -> IndexerResult<Option<MarketplaceEvent>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == *PHUNK_OFFERED_TOPIC {
        let hash_id = topic_at(log, 1)?;
        let to = address_from_topic(&topic_at(log, 2)?);
        let tokens = decode_data(log, &[ParamType::Uint(256)])?;
        let min_value = tokens[0]
            .clone()
            .into_uint()
            .ok_or_else(|| IndexerError::AbiDecodeError("PhunkOffered min value".to_string()))?;
        return Ok(Some(MarketplaceEvent::Offered {
            hash_id,
            min_value,
            to_address: if to.is_zero() { None } else { Some(to) },
        }));
    }
    if *topic0 == *PHUNK_BOUGHT_TOPIC {
        let hash_id = topic_at(log, 1)?;
        let from_address = address_from_topic(&topic_at(log, 2)?);
        let to_address = address_from_topic(&topic_at(log, 3)?);
        let tokens = decode_data(log, &[ParamType::Uint(256)])?;
        let value = tokens[0]
            .clone()
            .into_uint()
            .ok_or_else(|| IndexerError::AbiDecodeError("PhunkBought value".to_string()))?;
        return Ok(Some(MarketplaceEvent::Bought {
            hash_id,
            value,
            from_address,
            to_address,
        }));
    }
    if *topic0 == *PHUNK_NO_LONGER_FOR_SALE_TOPIC {
        let hash_id = topic_at(log, 1)?;
        return Ok(Some(MarketplaceEvent::NoLongerForSale { hash_id }));
    }
    Ok(None)
}

pub fn decode_bridge_l1_event(log: &Log) -> IndexerResult<Option<BridgeL1Event>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == *HASH_LOCKED_TOPIC {
        let hash_id = topic_at(log, 1)?;
        let prev_owner = address_from_topic(&topic_at(log, 2)?);
        let tokens = decode_data(log, &[ParamType::Uint(256), ParamType::Uint(256)])?;
        let nonce = tokens[0]
            .clone()
            .into_uint()
            .ok_or_else(|| IndexerError::AbiDecodeError("HashLocked nonce".to_string()))?
            .as_u64();
        let value = tokens[1]
            .clone()
            .into_uint()
            .ok_or_else(|| IndexerError::AbiDecodeError("HashLocked value".to_string()))?;
        return Ok(Some(BridgeL1Event::HashLocked {
            hash_id,
            prev_owner,
            nonce,
            value,
        }));
    }
    if *topic0 == *HASH_UNLOCKED_TOPIC {
        let hash_id = topic_at(log, 1)?;
        let prev_owner = address_from_topic(&topic_at(log, 2)?);
        return Ok(Some(BridgeL1Event::HashUnlocked { hash_id, prev_owner }));
    }
    Ok(None)
}

pub fn decode_bridge_l2_event(log: &Log) -> IndexerResult<Option<BridgeL2Event>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == *BRIDGED_IN_TOPIC {
        let hash_id = topic_at(log, 1)?;
        let owner = address_from_topic(&topic_at(log, 2)?);
        let tokens = decode_data(log, &[ParamType::Uint(256)])?;
        let token_id = tokens[0]
            .clone()
            .into_uint()
            .ok_or_else(|| IndexerError::AbiDecodeError("BridgedIn token id".to_string()))?;
        return Ok(Some(BridgeL2Event::BridgedIn {
            hash_id,
            owner,
            token_id,
        }));
    }
    if *topic0 == *ERC721_TRANSFER_TOPIC {
        // ERC-721 Transfer has all three args indexed
        let from = address_from_topic(&topic_at(log, 1)?);
        let to = address_from_topic(&topic_at(log, 2)?);
        let token_id = U256::from_big_endian(topic_at(log, 3)?.as_bytes());
        return Ok(Some(BridgeL2Event::Transfer { from, to, token_id }));
    }
    if *topic0 == *BRIDGED_OUT_TOPIC {
        let hash_id = topic_at(log, 1)?;
        let owner = address_from_topic(&topic_at(log, 2)?);
        return Ok(Some(BridgeL2Event::BridgedOut { hash_id, owner }));
    }
    Ok(None)
}

/// Extracts the user address referenced by a points-contract log. The value
/// carried by the event is deliberately ignored: totals are always re-read
/// from the contract.
pub fn decode_points_user(log: &Log) -> IndexerResult<Option<Address>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == *POINTS_ADDED_TOPIC {
        return Ok(Some(address_from_topic(&topic_at(log, 1)?)));
    }
    Ok(None)
}
