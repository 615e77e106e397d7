// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistence collaborator boundary.
//!
//! The indexer treats storage as an opaque key/value + relational store
//! behind the [`Store`] trait. [`MemoryStore`] is the in-process
//! implementation used by default and by tests; a relational backend only
//! needs to honor the same idempotency contracts (unique `tx_id` for events,
//! monotonic checkpoints, FIFO mint jobs).

use crate::error::{IndexerError, IndexerResult};
use crate::types::{
    BlockCheckpoint, BridgeRecord, Chain, CollectionItem, Ethscription, HashId, IndexedEvent,
    Listing, MintJob,
};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn checkpoint(&self, chain: Chain) -> IndexerResult<Option<BlockCheckpoint>>;

    /// Monotonic: a checkpoint older than the stored one is ignored, so
    /// reindexing an old block never rewinds the resume point.
    async fn advance_checkpoint(&self, checkpoint: BlockCheckpoint) -> IndexerResult<()>;

    async fn ethscription(&self, hash_id: &HashId) -> IndexerResult<Option<Ethscription>>;
    async fn ethscription_by_token_id(&self, token_id: u64) -> IndexerResult<Option<Ethscription>>;
    async fn sha_exists(&self, sha: &str) -> IndexerResult<bool>;
    async fn collection_item_by_sha(&self, sha: &str) -> IndexerResult<Option<CollectionItem>>;
    async fn register_collection_item(&self, item: CollectionItem) -> IndexerResult<()>;
    async fn create_ethscription(&self, asset: Ethscription) -> IndexerResult<()>;
    async fn update_owner(
        &self,
        hash_id: &HashId,
        new_owner: Address,
        prev_owner: Address,
    ) -> IndexerResult<()>;
    async fn set_locked(&self, hash_id: &HashId, locked: bool) -> IndexerResult<()>;

    async fn listing(&self, hash_id: &HashId) -> IndexerResult<Option<Listing>>;
    async fn put_listing(&self, listing: Listing) -> IndexerResult<()>;
    /// Returns whether a listing existed.
    async fn remove_listing(&self, hash_id: &HashId) -> IndexerResult<bool>;

    /// Append events, ignoring any whose `tx_id` was already stored. Returns
    /// the number of newly inserted rows.
    async fn append_events(&self, events: &[IndexedEvent]) -> IndexerResult<usize>;

    async fn points(&self, user: Address) -> IndexerResult<U256>;
    async fn set_points(&self, user: Address, total: U256) -> IndexerResult<()>;

    async fn bridge_record(&self, hash_id: &HashId) -> IndexerResult<Option<BridgeRecord>>;
    async fn put_bridge_record(&self, record: BridgeRecord) -> IndexerResult<()>;

    /// FIFO mint queue, persisted so pending mints survive a crash.
    async fn push_mint_job(&self, job: MintJob) -> IndexerResult<()>;
    async fn front_mint_job(&self) -> IndexerResult<Option<MintJob>>;
    /// Acknowledge successful submission of the front job.
    async fn ack_mint_job(&self, hash_id: &HashId) -> IndexerResult<()>;
    /// Park the front job as permanently failed.
    async fn fail_mint_job(&self, hash_id: &HashId) -> IndexerResult<()>;
    async fn bump_mint_attempts(&self, hash_id: &HashId) -> IndexerResult<u32>;
    async fn mint_queue_len(&self) -> IndexerResult<usize>;

    /// Snapshot of (hash_id, owner) pairs for consensus reconciliation.
    async fn owners_snapshot(&self) -> IndexerResult<Vec<(HashId, Address)>>;
}

#[derive(Default)]
struct MemoryStoreInner {
    checkpoints: HashMap<Chain, BlockCheckpoint>,
    assets: HashMap<HashId, Ethscription>,
    assets_by_token_id: HashMap<u64, HashId>,
    inscribed_shas: HashSet<String>,
    collection_items: HashMap<String, CollectionItem>,
    listings: HashMap<HashId, Listing>,
    events: BTreeMap<String, IndexedEvent>,
    points: HashMap<Address, U256>,
    bridge_records: HashMap<HashId, BridgeRecord>,
    mint_jobs: VecDeque<MintJob>,
    failed_mint_jobs: Vec<MintJob>,
}

/// In-memory [`Store`]. Single writer assumed, as everywhere in the indexer.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored audit-log rows (test/inspection helper).
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn failed_mint_jobs(&self) -> Vec<MintJob> {
        self.inner.read().await.failed_mint_jobs.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn checkpoint(&self, chain: Chain) -> IndexerResult<Option<BlockCheckpoint>> {
        Ok(self.inner.read().await.checkpoints.get(&chain).copied())
    }

    async fn advance_checkpoint(&self, checkpoint: BlockCheckpoint) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.checkpoints.entry(checkpoint.chain);
        match entry {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                if checkpoint.block_number > o.get().block_number {
                    o.insert(checkpoint);
                }
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(checkpoint);
            }
        }
        Ok(())
    }

    async fn ethscription(&self, hash_id: &HashId) -> IndexerResult<Option<Ethscription>> {
        Ok(self.inner.read().await.assets.get(hash_id).cloned())
    }

    async fn ethscription_by_token_id(&self, token_id: u64) -> IndexerResult<Option<Ethscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .assets_by_token_id
            .get(&token_id)
            .and_then(|h| inner.assets.get(h))
            .cloned())
    }

    async fn sha_exists(&self, sha: &str) -> IndexerResult<bool> {
        Ok(self.inner.read().await.inscribed_shas.contains(sha))
    }

    async fn collection_item_by_sha(&self, sha: &str) -> IndexerResult<Option<CollectionItem>> {
        Ok(self.inner.read().await.collection_items.get(sha).cloned())
    }

    async fn register_collection_item(&self, item: CollectionItem) -> IndexerResult<()> {
        self.inner
            .write()
            .await
            .collection_items
            .insert(item.sha.clone(), item);
        Ok(())
    }

    async fn create_ethscription(&self, asset: Ethscription) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        if inner.assets.contains_key(&asset.hash_id) {
            return Err(IndexerError::StorageError(format!(
                "ethscription {:#x} already exists",
                asset.hash_id
            )));
        }
        inner.inscribed_shas.insert(asset.sha.clone());
        inner.assets_by_token_id.insert(asset.token_id, asset.hash_id);
        inner.assets.insert(asset.hash_id, asset);
        Ok(())
    }

    async fn update_owner(
        &self,
        hash_id: &HashId,
        new_owner: Address,
        prev_owner: Address,
    ) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        let asset = inner.assets.get_mut(hash_id).ok_or_else(|| {
            IndexerError::StorageError(format!("unknown ethscription {:#x}", hash_id))
        })?;
        asset.owner = new_owner;
        asset.prev_owner = Some(prev_owner);
        Ok(())
    }

    async fn set_locked(&self, hash_id: &HashId, locked: bool) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        let asset = inner.assets.get_mut(hash_id).ok_or_else(|| {
            IndexerError::StorageError(format!("unknown ethscription {:#x}", hash_id))
        })?;
        asset.locked = locked;
        Ok(())
    }

    async fn listing(&self, hash_id: &HashId) -> IndexerResult<Option<Listing>> {
        Ok(self.inner.read().await.listings.get(hash_id).cloned())
    }

    async fn put_listing(&self, listing: Listing) -> IndexerResult<()> {
        self.inner
            .write()
            .await
            .listings
            .insert(listing.hash_id, listing);
        Ok(())
    }

    async fn remove_listing(&self, hash_id: &HashId) -> IndexerResult<bool> {
        Ok(self.inner.write().await.listings.remove(hash_id).is_some())
    }

    async fn append_events(&self, events: &[IndexedEvent]) -> IndexerResult<usize> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for event in events {
            if !inner.events.contains_key(&event.tx_id) {
                inner.events.insert(event.tx_id.clone(), event.clone());
                inserted += 1;
            } else {
                debug!("Skipping duplicate event {}", event.tx_id);
            }
        }
        Ok(inserted)
    }

    async fn points(&self, user: Address) -> IndexerResult<U256> {
        Ok(self
            .inner
            .read()
            .await
            .points
            .get(&user)
            .copied()
            .unwrap_or_default())
    }

    async fn set_points(&self, user: Address, total: U256) -> IndexerResult<()> {
        self.inner.write().await.points.insert(user, total);
        Ok(())
    }

    async fn bridge_record(&self, hash_id: &HashId) -> IndexerResult<Option<BridgeRecord>> {
        Ok(self.inner.read().await.bridge_records.get(hash_id).cloned())
    }

    async fn put_bridge_record(&self, record: BridgeRecord) -> IndexerResult<()> {
        self.inner
            .write()
            .await
            .bridge_records
            .insert(record.hash_id, record);
        Ok(())
    }

    async fn push_mint_job(&self, job: MintJob) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        // Re-locking an asset with a pending mint replaces the stale job
        inner.mint_jobs.retain(|j| j.hash_id != job.hash_id);
        inner.mint_jobs.push_back(job);
        Ok(())
    }

    async fn front_mint_job(&self) -> IndexerResult<Option<MintJob>> {
        Ok(self.inner.read().await.mint_jobs.front().cloned())
    }

    async fn ack_mint_job(&self, hash_id: &HashId) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        match inner.mint_jobs.front() {
            Some(front) if &front.hash_id == hash_id => {
                inner.mint_jobs.pop_front();
                Ok(())
            }
            _ => Err(IndexerError::StorageError(format!(
                "mint job {:#x} is not at queue front",
                hash_id
            ))),
        }
    }

    async fn fail_mint_job(&self, hash_id: &HashId) -> IndexerResult<()> {
        let mut inner = self.inner.write().await;
        match inner.mint_jobs.front() {
            Some(front) if &front.hash_id == hash_id => {
                let job = inner.mint_jobs.pop_front().expect("front exists");
                inner.failed_mint_jobs.push(job);
                Ok(())
            }
            _ => Err(IndexerError::StorageError(format!(
                "mint job {:#x} is not at queue front",
                hash_id
            ))),
        }
    }

    async fn bump_mint_attempts(&self, hash_id: &HashId) -> IndexerResult<u32> {
        let mut inner = self.inner.write().await;
        let job = inner
            .mint_jobs
            .iter_mut()
            .find(|j| &j.hash_id == hash_id)
            .ok_or_else(|| {
                IndexerError::StorageError(format!("unknown mint job {:#x}", hash_id))
            })?;
        job.attempts += 1;
        Ok(job.attempts)
    }

    async fn mint_queue_len(&self) -> IndexerResult<usize> {
        Ok(self.inner.read().await.mint_jobs.len())
    }

    async fn owners_snapshot(&self) -> IndexerResult<Vec<(HashId, Address)>> {
        Ok(self
            .inner
            .read()
            .await
            .assets
            .values()
            .map(|a| (a.hash_id, a.owner))
            .collect())
    }
}
