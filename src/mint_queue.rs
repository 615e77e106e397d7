// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Single-flight L2 mint worker.
//!
//! Mint jobs are persisted through the [`Store`] (they survive a crash) and
//! drained strictly one at a time with a fixed pacing delay between
//! submissions: a single relayer key signs every mint, so concurrent
//! submission would only produce nonce contention. Each job is simulated
//! before it is sent; a job that keeps failing is parked as permanently
//! failed after a bounded number of attempts instead of blocking the queue
//! forever.

use crate::chain_client::MintSubmitter;
use crate::error::{IndexerError, IndexerResult};
use crate::metrics::IndexerMetrics;
use crate::storage::Store;
use crate::types::{CollectionItem, HashId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Builds the base64 JSON metadata document for an L2 mint. The attribute
/// schema (`trait_type`/`value` pairs plus the literal `Hash ID` trait) is an
/// on-chain contract shared with the L2 collection; do not reshape it.
pub fn build_mint_metadata(item: &CollectionItem, hash_id: HashId) -> String {
    let mut attributes: Vec<serde_json::Value> = item
        .attributes
        .iter()
        .map(|(trait_type, value)| json!({ "trait_type": trait_type, "value": value }))
        .collect();
    attributes.push(json!({ "trait_type": "Hash ID", "value": format!("{:#x}", hash_id) }));
    let document = json!({ "name": item.name, "attributes": attributes });
    BASE64.encode(document.to_string())
}

pub struct MintQueueWorker<S> {
    store: Arc<S>,
    submitter: Arc<dyn MintSubmitter>,
    metrics: Arc<IndexerMetrics>,
    pace: Duration,
    max_attempts: u32,
}

impl<S: Store> MintQueueWorker<S> {
    pub fn new(
        store: Arc<S>,
        submitter: Arc<dyn MintSubmitter>,
        metrics: Arc<IndexerMetrics>,
        pace: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            submitter,
            metrics,
            pace,
            max_attempts,
        }
    }

    /// Drains the mint queue until cancelled, one job per pacing tick.
    pub async fn run(&self, cancel: CancellationToken) -> IndexerResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.pace) => {}
            }
            if let Err(e) = self.process_next().await {
                self.metrics
                    .errors
                    .with_label_values(&[e.error_type()])
                    .inc();
                warn!("mint worker: {}", e);
            }
        }
    }

    /// Attempts the front job once. Success acknowledges it; a failure either
    /// leaves it at the front for the next tick or, once the attempt budget
    /// is spent, parks it as permanently failed.
    pub async fn process_next(&self) -> IndexerResult<()> {
        let Some(job) = self.store.front_mint_job().await? else {
            return Ok(());
        };

        let result = self.mint(&job.hash_id, job.owner).await;
        match result {
            Ok(tx_hash) => {
                self.store.ack_mint_job(&job.hash_id).await?;
                self.metrics.mints_submitted.inc();
                info!(
                    "[mint] {:#x} minted to {:#x} in {:#x}",
                    job.hash_id, job.owner, tx_hash
                );
            }
            Err(e) => {
                let attempts = self.store.bump_mint_attempts(&job.hash_id).await?;
                if attempts >= self.max_attempts {
                    self.store.fail_mint_job(&job.hash_id).await?;
                    self.metrics.mints_failed.inc();
                    error!(
                        "[mint] {:#x} failed permanently after {} attempts: {}",
                        job.hash_id, attempts, e
                    );
                } else {
                    warn!(
                        "[mint] {:#x} attempt {}/{} failed: {}",
                        job.hash_id, attempts, self.max_attempts, e
                    );
                }
            }
        }
        self.metrics
            .mint_queue_depth
            .set(self.store.mint_queue_len().await? as i64);
        Ok(())
    }

    async fn mint(
        &self,
        hash_id: &HashId,
        owner: ethers::types::Address,
    ) -> IndexerResult<ethers::types::H256> {
        let asset = self.store.ethscription(hash_id).await?.ok_or_else(|| {
            IndexerError::ConsistencyViolation(format!(
                "mint job for unknown ethscription {:#x}",
                hash_id
            ))
        })?;
        let item = self
            .store
            .collection_item_by_sha(&asset.sha)
            .await?
            .ok_or_else(|| {
                IndexerError::ConsistencyViolation(format!(
                    "no collection item for sha {} of {:#x}",
                    asset.sha, hash_id
                ))
            })?;
        let metadata = build_mint_metadata(&item, *hash_id);
        let token_id = ethers::types::U256::from(asset.token_id);

        self.submitter
            .simulate_mint(owner, token_id, *hash_id, &metadata)
            .await?;
        self.submitter
            .submit_mint(owner, token_id, *hash_id, &metadata)
            .await
    }
}
