// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-asset bridge lifecycle.
//!
//! The state machine is driven by decoded L1 and L2 logs and persists one
//! [`BridgeRecord`] per asset. L1 and L2 are observed by independent pollers,
//! so events can arrive out of order and any event can be replayed after a
//! restart; every transition is therefore idempotent and tolerant of a
//! missing predecessor. An impossible transition is reported (error log plus
//! the consistency-violation counter) and then applied anyway so a single
//! confused asset cannot wedge the pipeline.
//!
//! `on_hash_locked` is the only producer of mint jobs.

use crate::error::IndexerResult;
use crate::metrics::IndexerMetrics;
use crate::storage::Store;
use crate::types::{BridgeRecord, BridgeState, HashId, MintJob};
use ethers::types::Address;
use std::sync::Arc;
use tracing::{error, info};

pub struct BridgeStateMachine<S> {
    store: Arc<S>,
    metrics: Arc<IndexerMetrics>,
}

impl<S: Store> BridgeStateMachine<S> {
    pub fn new(store: Arc<S>, metrics: Arc<IndexerMetrics>) -> Self {
        Self { store, metrics }
    }

    fn record_transition(&self, state: BridgeState) {
        self.metrics
            .bridge_transitions
            .with_label_values(&[state.as_str()])
            .inc();
    }

    fn report_violation(&self, message: String) {
        error!("bridge consistency violation: {}", message);
        self.metrics.consistency_violations.inc();
    }

    /// L1 `HashLocked`. Locks the asset and queues the L2 mint. Returns the
    /// mint job exactly once per lock; replays return `None`.
    pub async fn on_hash_locked(
        &self,
        hash_id: HashId,
        prev_owner: Address,
        nonce: u64,
        block: u64,
    ) -> IndexerResult<Option<MintJob>> {
        let mut record = self
            .store
            .bridge_record(&hash_id)
            .await?
            .unwrap_or_else(|| BridgeRecord::new(hash_id, prev_owner));

        if record.nonce == nonce
            && matches!(
                record.state,
                BridgeState::QueuedForMint | BridgeState::MintedL2
            )
        {
            // Replay of a lock we already acted on
            return Ok(None);
        }

        record.state = BridgeState::QueuedForMint;
        record.l1_owner = prev_owner;
        record.l2_owner = None;
        record.nonce = nonce;
        record.updated_at_block = block;
        self.store.put_bridge_record(record).await?;
        self.store.set_locked(&hash_id, true).await?;
        self.record_transition(BridgeState::QueuedForMint);
        info!(
            "[bridge] {:#x} locked by {:#x} (nonce {}), mint queued",
            hash_id, prev_owner, nonce
        );
        Ok(Some(MintJob {
            hash_id,
            owner: prev_owner,
            attempts: 0,
        }))
    }

    /// L2 `BridgedIn`: the mint landed.
    pub async fn on_minted(
        &self,
        hash_id: HashId,
        owner: Address,
        block: u64,
    ) -> IndexerResult<()> {
        let mut record = match self.store.bridge_record(&hash_id).await? {
            Some(record) => record,
            None => {
                // L2 observed before L1; start the record from what we know
                self.report_violation(format!(
                    "{:#x} minted on L2 before a lock was observed",
                    hash_id
                ));
                BridgeRecord::new(hash_id, owner)
            }
        };

        if record.state == BridgeState::MintedL2 && record.l2_owner == Some(owner) {
            return Ok(());
        }

        record.state = BridgeState::MintedL2;
        record.l2_owner = Some(owner);
        record.updated_at_block = block;
        self.store.put_bridge_record(record).await?;
        self.record_transition(BridgeState::MintedL2);
        Ok(())
    }

    /// L2 ERC-721 transfer of a bridged token. Only moves the tracked L2
    /// owner; the L1 side stays locked.
    pub async fn on_l2_transfer(
        &self,
        hash_id: HashId,
        to: Address,
        block: u64,
    ) -> IndexerResult<()> {
        let Some(mut record) = self.store.bridge_record(&hash_id).await? else {
            self.report_violation(format!(
                "{:#x} transferred on L2 without a bridge record",
                hash_id
            ));
            return Ok(());
        };
        if record.l2_owner == Some(to) {
            return Ok(());
        }
        record.l2_owner = Some(to);
        record.updated_at_block = block;
        self.store.put_bridge_record(record).await?;
        Ok(())
    }

    /// L2 transfer into the collection contract itself: a burn request.
    pub async fn on_burn_requested(
        &self,
        hash_id: HashId,
        requester: Address,
        block: u64,
    ) -> IndexerResult<()> {
        let Some(mut record) = self.store.bridge_record(&hash_id).await? else {
            self.report_violation(format!(
                "{:#x} burn requested without a bridge record",
                hash_id
            ));
            return Ok(());
        };
        if record.state == BridgeState::QueuedForBurn {
            return Ok(());
        }
        if record.state != BridgeState::MintedL2 {
            self.report_violation(format!(
                "{:#x} burn requested from state {}",
                hash_id,
                record.state.as_str()
            ));
        }
        record.state = BridgeState::QueuedForBurn;
        record.l2_owner = Some(requester);
        record.updated_at_block = block;
        self.store.put_bridge_record(record).await?;
        self.record_transition(BridgeState::QueuedForBurn);
        Ok(())
    }

    /// L2 `BridgedOut`: the token left L2, pending the L1 unlock.
    pub async fn on_bridged_out(
        &self,
        hash_id: HashId,
        owner: Address,
        block: u64,
    ) -> IndexerResult<()> {
        let Some(mut record) = self.store.bridge_record(&hash_id).await? else {
            self.report_violation(format!(
                "{:#x} bridged out without a bridge record",
                hash_id
            ));
            return Ok(());
        };
        if record.state == BridgeState::BridgedOut {
            return Ok(());
        }
        if !matches!(
            record.state,
            BridgeState::MintedL2 | BridgeState::QueuedForBurn
        ) {
            self.report_violation(format!(
                "{:#x} bridged out from state {}",
                hash_id,
                record.state.as_str()
            ));
        }
        record.state = BridgeState::BridgedOut;
        record.l2_owner = Some(owner);
        record.updated_at_block = block;
        self.store.put_bridge_record(record).await?;
        self.record_transition(BridgeState::BridgedOut);
        Ok(())
    }

    /// L1 `HashUnlocked`: the round trip completes. The L1 owner becomes the
    /// last observed L2 owner.
    pub async fn on_hash_unlocked(&self, hash_id: HashId, block: u64) -> IndexerResult<()> {
        let Some(mut record) = self.store.bridge_record(&hash_id).await? else {
            self.report_violation(format!(
                "{:#x} unlocked without a bridge record",
                hash_id
            ));
            return Ok(());
        };
        if record.state == BridgeState::Unlocked {
            return Ok(());
        }
        if !matches!(
            record.state,
            BridgeState::BridgedOut | BridgeState::QueuedForBurn
        ) {
            self.report_violation(format!(
                "{:#x} unlocked from state {}",
                hash_id,
                record.state.as_str()
            ));
        }

        if let Some(l2_owner) = record.l2_owner {
            if l2_owner != record.l1_owner {
                self.store
                    .update_owner(&hash_id, l2_owner, record.l1_owner)
                    .await?;
            }
            record.l1_owner = l2_owner;
        }
        record.state = BridgeState::Unlocked;
        record.updated_at_block = block;
        self.store.put_bridge_record(record).await?;
        self.store.set_locked(&hash_id, false).await?;
        self.record_transition(BridgeState::Unlocked);
        info!("[bridge] {:#x} unlocked", hash_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::Ethscription;
    use ethers::types::H256;

    fn hash(n: u64) -> HashId {
        H256::from_low_u64_be(n)
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    async fn setup(owner: Address) -> (Arc<MemoryStore>, BridgeStateMachine<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_ethscription(Ethscription {
                hash_id: hash(1),
                sha: "sha-1".to_string(),
                slug: "phunk".to_string(),
                token_id: 1,
                creator: owner,
                owner,
                prev_owner: None,
                locked: false,
                created_at: 0,
            })
            .await
            .unwrap();
        let machine =
            BridgeStateMachine::new(store.clone(), Arc::new(IndexerMetrics::new_for_testing()));
        (store, machine)
    }

    #[tokio::test]
    async fn test_lock_produces_one_mint_job() {
        let (store, machine) = setup(addr(1)).await;
        let job = machine
            .on_hash_locked(hash(1), addr(1), 1, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.owner, addr(1));
        assert!(store.ethscription(&hash(1)).await.unwrap().unwrap().locked);

        // Replay of the same lock yields no second job
        assert!(machine
            .on_hash_locked(hash(1), addr(1), 1, 100)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_round_trip_sets_l1_owner_to_final_l2_owner() {
        let (store, machine) = setup(addr(1)).await;
        machine
            .on_hash_locked(hash(1), addr(1), 1, 100)
            .await
            .unwrap();
        machine.on_minted(hash(1), addr(1), 110).await.unwrap();
        machine.on_l2_transfer(hash(1), addr(2), 120).await.unwrap();
        machine.on_l2_transfer(hash(1), addr(3), 130).await.unwrap();
        machine
            .on_burn_requested(hash(1), addr(3), 140)
            .await
            .unwrap();
        machine.on_bridged_out(hash(1), addr(3), 150).await.unwrap();
        machine.on_hash_unlocked(hash(1), 160).await.unwrap();

        let record = store.bridge_record(&hash(1)).await.unwrap().unwrap();
        assert_eq!(record.state, BridgeState::Unlocked);
        assert_eq!(record.l1_owner, addr(3));

        let asset = store.ethscription(&hash(1)).await.unwrap().unwrap();
        assert!(!asset.locked);
        assert_eq!(asset.owner, addr(3));
        assert_eq!(asset.prev_owner, Some(addr(1)));
    }

    #[tokio::test]
    async fn test_replayed_transitions_are_noops() {
        let (store, machine) = setup(addr(1)).await;
        machine
            .on_hash_locked(hash(1), addr(1), 1, 100)
            .await
            .unwrap();
        machine.on_minted(hash(1), addr(1), 110).await.unwrap();
        machine.on_minted(hash(1), addr(1), 110).await.unwrap();
        machine.on_l2_transfer(hash(1), addr(2), 120).await.unwrap();
        machine.on_l2_transfer(hash(1), addr(2), 120).await.unwrap();

        let record = store.bridge_record(&hash(1)).await.unwrap().unwrap();
        assert_eq!(record.state, BridgeState::MintedL2);
        assert_eq!(record.l2_owner, Some(addr(2)));
    }

    #[tokio::test]
    async fn test_minted_before_lock_is_reported_but_applied() {
        let (store, machine) = setup(addr(1)).await;
        machine.on_minted(hash(1), addr(1), 110).await.unwrap();
        let record = store.bridge_record(&hash(1)).await.unwrap().unwrap();
        assert_eq!(record.state, BridgeState::MintedL2);
    }

    #[tokio::test]
    async fn test_unlock_without_l2_activity_keeps_l1_owner() {
        let (store, machine) = setup(addr(1)).await;
        machine
            .on_hash_locked(hash(1), addr(1), 1, 100)
            .await
            .unwrap();
        // L2 never observed; unlock keeps the original owner
        machine.on_hash_unlocked(hash(1), 160).await.unwrap();
        let record = store.bridge_record(&hash(1)).await.unwrap().unwrap();
        assert_eq!(record.state, BridgeState::Unlocked);
        assert_eq!(record.l1_owner, addr(1));
        let asset = store.ethscription(&hash(1)).await.unwrap().unwrap();
        assert_eq!(asset.owner, addr(1));
        assert!(!asset.locked);
    }
}
