// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ownership reconciliation against an authoritative source.
//!
//! The indexer's owner table is derived state and can drift (missed block,
//! operator reindex, protocol edge case). The checker periodically compares
//! every unlocked asset's local owner against the registry contract and
//! reports divergences; it never mutates local state on its own, reconciling
//! is an operator decision.

use crate::error::IndexerResult;
use crate::metrics::IndexerMetrics;
use crate::storage::Store;
use crate::types::HashId;
use async_trait::async_trait;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[async_trait]
pub trait OwnershipOracle: Send + Sync + 'static {
    /// The authoritative current owner, or `None` when the source does not
    /// know the asset.
    async fn owner_of(&self, hash_id: &HashId) -> IndexerResult<Option<Address>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub hash_id: HashId,
    pub local_owner: Address,
    pub authoritative_owner: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusReport {
    pub checked: usize,
    pub skipped_locked: usize,
    pub divergences: Vec<Divergence>,
}

pub struct ConsensusChecker<S> {
    store: Arc<S>,
    oracle: Arc<dyn OwnershipOracle>,
    metrics: Arc<IndexerMetrics>,
    interval: Duration,
}

impl<S: Store> ConsensusChecker<S> {
    pub fn new(
        store: Arc<S>,
        oracle: Arc<dyn OwnershipOracle>,
        metrics: Arc<IndexerMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            metrics,
            interval,
        }
    }

    /// One full reconciliation pass. Locked assets are skipped: while bridged,
    /// the registry shows the bridge contract as owner and the local record
    /// deliberately keeps the user.
    pub async fn check_once(&self) -> IndexerResult<ConsensusReport> {
        let mut report = ConsensusReport::default();
        for (hash_id, local_owner) in self.store.owners_snapshot().await? {
            let locked = self
                .store
                .ethscription(&hash_id)
                .await?
                .map(|a| a.locked)
                .unwrap_or(false);
            if locked {
                report.skipped_locked += 1;
                continue;
            }
            report.checked += 1;
            let authoritative_owner = self.oracle.owner_of(&hash_id).await?;
            if authoritative_owner != Some(local_owner) {
                error!(
                    "ownership divergence for {:#x}: local {:#x}, authoritative {:?}",
                    hash_id, local_owner, authoritative_owner
                );
                self.metrics.consistency_violations.inc();
                report.divergences.push(Divergence {
                    hash_id,
                    local_owner,
                    authoritative_owner,
                });
            }
        }
        if report.divergences.is_empty() {
            info!(
                "consensus check passed ({} assets, {} locked skipped)",
                report.checked, report.skipped_locked
            );
        } else {
            warn!(
                "consensus check found {} divergences out of {} assets",
                report.divergences.len(),
                report.checked
            );
        }
        Ok(report)
    }

    pub async fn run(&self, cancel: CancellationToken) -> IndexerResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.check_once().await {
                self.metrics
                    .errors
                    .with_label_values(&[e.error_type()])
                    .inc();
                warn!("consensus check failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::Ethscription;
    use ethers::types::H256;
    use std::collections::HashMap;

    struct MapOracle(HashMap<HashId, Address>);

    #[async_trait]
    impl OwnershipOracle for MapOracle {
        async fn owner_of(&self, hash_id: &HashId) -> IndexerResult<Option<Address>> {
            Ok(self.0.get(hash_id).copied())
        }
    }

    fn hash(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    async fn seed(store: &MemoryStore, n: u64, owner: Address, locked: bool) {
        store
            .create_ethscription(Ethscription {
                hash_id: hash(n),
                sha: format!("sha-{}", n),
                slug: "phunk".to_string(),
                token_id: n,
                creator: owner,
                owner,
                prev_owner: None,
                locked,
                created_at: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_matching_owners_produce_no_divergence() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, addr(0xA), false).await;
        seed(&store, 2, addr(0xB), false).await;
        let oracle = Arc::new(MapOracle(HashMap::from([
            (hash(1), addr(0xA)),
            (hash(2), addr(0xB)),
        ])));
        let checker = ConsensusChecker::new(
            store,
            oracle,
            Arc::new(IndexerMetrics::new_for_testing()),
            Duration::from_secs(60),
        );
        let report = checker.check_once().await.unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.divergences.is_empty());
    }

    #[tokio::test]
    async fn test_divergence_is_reported_not_corrected() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, addr(0xA), false).await;
        let oracle = Arc::new(MapOracle(HashMap::from([(hash(1), addr(0xB))])));
        let checker = ConsensusChecker::new(
            store.clone(),
            oracle,
            Arc::new(IndexerMetrics::new_for_testing()),
            Duration::from_secs(60),
        );
        let report = checker.check_once().await.unwrap();
        assert_eq!(
            report.divergences,
            vec![Divergence {
                hash_id: hash(1),
                local_owner: addr(0xA),
                authoritative_owner: Some(addr(0xB)),
            }]
        );
        // Local state untouched
        assert_eq!(
            store.ethscription(&hash(1)).await.unwrap().unwrap().owner,
            addr(0xA)
        );
    }

    #[tokio::test]
    async fn test_locked_assets_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, addr(0xA), true).await;
        // The registry would show the bridge contract here
        let oracle = Arc::new(MapOracle(HashMap::from([(hash(1), addr(0xFF))])));
        let checker = ConsensusChecker::new(
            store,
            oracle,
            Arc::new(IndexerMetrics::new_for_testing()),
            Duration::from_secs(60),
        );
        let report = checker.check_once().await.unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(report.skipped_locked, 1);
        assert!(report.divergences.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_asset_upstream_is_a_divergence() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, addr(0xA), false).await;
        let oracle = Arc::new(MapOracle(HashMap::new()));
        let checker = ConsensusChecker::new(
            store,
            oracle,
            Arc::new(IndexerMetrics::new_for_testing()),
            Duration::from_secs(60),
        );
        let report = checker.check_once().await.unwrap();
        assert_eq!(report.divergences.len(), 1);
        assert_eq!(report.divergences[0].authoritative_owner, None);
    }
}
