// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Admin and observability surface.
//!
//! Every admin route is keyed by chain (`l1`/`l2`) so both pipelines are
//! reachable. Reindex endpoints re-run classification without touching the
//! block checkpoint, and event insertion is idempotent by `tx_id`, so
//! reindexing old blocks is always safe.

use crate::block_queue::{BlockQueue, JobCounts};
use crate::error::IndexerError;
use crate::processor::BlockProcessor;
use crate::storage::Store;
use crate::types::Chain;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::H256;
use prometheus::{Registry, TextEncoder};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";
pub const QUEUE_PATH: &str = "/admin/queue";
// Note: :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const REINDEX_BLOCK_PATH: &str = "/admin/:chain/reindex/block/:block_num";
pub const REINDEX_TX_PATH: &str = "/admin/:chain/reindex/tx/:tx_hash";
pub const PAUSE_PATH: &str = "/admin/:chain/pause";
pub const RESUME_PATH: &str = "/admin/:chain/resume";

/// Admin handle on one chain's pipeline.
pub struct ChainAdmin<S> {
    pub chain: Chain,
    pub queue: Arc<BlockQueue>,
    pub processor: Arc<BlockProcessor<S>>,
}

pub struct AppState<S> {
    pub chains: Vec<ChainAdmin<S>>,
    pub registry: Registry,
}

impl<S> AppState<S> {
    fn chain(&self, label: &str) -> Result<&ChainAdmin<S>, IndexerError> {
        let chain: Chain = label.parse().map_err(IndexerError::RestAPIError)?;
        self.chains
            .iter()
            .find(|admin| admin.chain == chain)
            .ok_or_else(|| {
                IndexerError::RestAPIError(format!("chain {} is not configured", chain))
            })
    }
}

impl IntoResponse for IndexerError {
    fn into_response(self) -> Response {
        let status = match &self {
            IndexerError::TxNotFound | IndexerError::BlockNotFound(_) => StatusCode::NOT_FOUND,
            IndexerError::InvalidConfig(_) | IndexerError::RestAPIError(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn run_server<S: Store>(
    socket_address: &SocketAddr,
    state: Arc<AppState<S>>,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await.unwrap();
        axum::serve(listener, make_router(state).into_make_service())
            .await
            .unwrap();
    })
}

pub(crate) fn make_router<S: Store>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/", get(health))
        .route(HEALTH_PATH, get(health))
        .route(METRICS_PATH, get(metrics::<S>))
        .route(QUEUE_PATH, get(queue_counts::<S>))
        .route(REINDEX_BLOCK_PATH, post(reindex_block::<S>))
        .route(REINDEX_TX_PATH, post(reindex_tx::<S>))
        .route(PAUSE_PATH, post(pause::<S>))
        .route(RESUME_PATH, post(resume::<S>))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics<S: Store>(State(state): State<Arc<AppState<S>>>) -> Result<String, IndexerError> {
    TextEncoder::new()
        .encode_to_string(&state.registry.gather())
        .map_err(|e| IndexerError::RestAPIError(format!("metrics encoding: {}", e)))
}

async fn queue_counts<S: Store>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<BTreeMap<String, JobCounts>> {
    let mut counts = BTreeMap::new();
    for admin in &state.chains {
        counts.insert(admin.chain.to_string(), admin.queue.job_counts().await);
    }
    Json(counts)
}

async fn reindex_block<S: Store>(
    Path((chain, block_num)): Path<(String, u64)>,
    State(state): State<Arc<AppState<S>>>,
) -> Result<StatusCode, IndexerError> {
    let admin = state.chain(&chain)?;
    info!("admin: [{}] reindexing block {}", admin.chain, block_num);
    admin.processor.reindex_block(block_num).await?;
    Ok(StatusCode::OK)
}

async fn reindex_tx<S: Store>(
    Path((chain, tx_hash)): Path<(String, String)>,
    State(state): State<Arc<AppState<S>>>,
) -> Result<StatusCode, IndexerError> {
    let admin = state.chain(&chain)?;
    let tx_hash: H256 = tx_hash
        .parse()
        .map_err(|_| IndexerError::RestAPIError(format!("invalid tx hash {}", tx_hash)))?;
    info!("admin: [{}] reindexing tx {:#x}", admin.chain, tx_hash);
    admin.processor.reindex_transaction(tx_hash).await?;
    Ok(StatusCode::OK)
}

async fn pause<S: Store>(
    Path(chain): Path<String>,
    State(state): State<Arc<AppState<S>>>,
) -> Result<StatusCode, IndexerError> {
    state.chain(&chain)?.queue.pause().await;
    Ok(StatusCode::OK)
}

async fn resume<S: Store>(
    Path(chain): Path<String>,
    State(state): State<Arc<AppState<S>>>,
) -> Result<StatusCode, IndexerError> {
    state.chain(&chain)?.queue.resume().await;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::{ChainReader, FullBlock, TransactionWithReceipt};
    use crate::error::IndexerResult;
    use crate::metrics::IndexerMetrics;
    use crate::processor::ProcessorContracts;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EmptyChain;

    #[async_trait]
    impl ChainReader for EmptyChain {
        async fn latest_block_number(&self) -> IndexerResult<u64> {
            Ok(100)
        }
        async fn full_block(&self, block_num: u64) -> IndexerResult<FullBlock> {
            Ok(FullBlock {
                number: block_num,
                hash: H256::from_low_u64_be(block_num),
                timestamp: 0,
                transactions: vec![],
            })
        }
        async fn full_transaction(
            &self,
            _tx_hash: H256,
        ) -> IndexerResult<TransactionWithReceipt> {
            Err(IndexerError::TxNotFound)
        }
    }

    fn state() -> (Arc<AppState<MemoryStore>>, Arc<MemoryStore>) {
        let registry = Registry::new();
        let metrics = Arc::new(IndexerMetrics::new(&registry));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(BlockQueue::new(
            Chain::L1,
            Duration::from_millis(1),
            3,
            metrics.clone(),
        ));
        let processor = Arc::new(BlockProcessor::new(
            Chain::L1,
            store.clone(),
            Arc::new(EmptyChain),
            None,
            ProcessorContracts::default(),
            metrics,
        ));
        let state = Arc::new(AppState {
            chains: vec![ChainAdmin {
                chain: Chain::L1,
                queue,
                processor,
            }],
            registry,
        });
        (state, store)
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle_the_queue() {
        let (state, _) = state();
        pause(Path("l1".to_string()), State(state.clone()))
            .await
            .unwrap();
        assert!(state.chains[0].queue.job_counts().await.paused);
        resume(Path("l1".to_string()), State(state.clone()))
            .await
            .unwrap();
        assert!(!state.chains[0].queue.job_counts().await.paused);
    }

    #[tokio::test]
    async fn test_unknown_chain_is_rejected() {
        let (state, _) = state();
        let err = pause(Path("mainnet".to_string()), State(state))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::RestAPIError(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_chain_is_rejected() {
        let (state, _) = state();
        // Only l1 is wired in this node
        let err = resume(Path("l2".to_string()), State(state))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::RestAPIError(_)));
    }

    #[tokio::test]
    async fn test_reindex_block_does_not_touch_the_checkpoint() {
        let (state, store) = state();
        let status = reindex_block(Path(("l1".to_string(), 42)), State(state))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(store.checkpoint(Chain::L1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reindex_tx_rejects_garbage_hashes() {
        let (state, _) = state();
        let err = reindex_tx(
            Path(("l1".to_string(), "nonsense".to_string())),
            State(state),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexerError::RestAPIError(_)));
    }

    #[tokio::test]
    async fn test_queue_counts_lists_every_chain() {
        let (state, _) = state();
        let Json(counts) = queue_counts(State(state)).await;
        assert_eq!(counts.len(), 1);
        assert!(counts.contains_key("l1"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        let (state, _) = state();
        let body = metrics(State(state)).await.unwrap();
        assert!(body.contains("server_uptime_seconds"));
    }

    #[tokio::test]
    async fn test_unknown_tx_maps_to_not_found() {
        let err = IndexerError::TxNotFound;
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
