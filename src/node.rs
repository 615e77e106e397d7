// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node assembly: builds the per-chain pipelines from config, starts the
//! admin server, and supervises the whole thing with a restart-on-fatal-error
//! loop. A failed component cancels its siblings, everything is torn down,
//! and the pipelines start again from the persisted checkpoints after a fixed
//! delay. A terminal error (a stuck block) stops the supervision loop
//! instead, leaving the stuck gauge set for the operator.

use crate::block_queue::{BlockHandler, BlockQueue};
use crate::chain_client::{
    ChainReader, EthChainClient, EthMintSubmitter, MintSubmitter, PointsReader,
};
use crate::config::{IndexerNodeConfig, L2Config};
use crate::consensus::{ConsensusChecker, OwnershipOracle};
use crate::controller::SyncController;
use crate::error::IndexerResult;
use crate::metrics::IndexerMetrics;
use crate::mint_queue::MintQueueWorker;
use crate::processor::{BlockProcessor, ProcessorContracts};
use crate::server::{self, AppState};
use crate::storage::{MemoryStore, Store};
use crate::types::{Chain, CollectionItem};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use prometheus::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct ChainPipeline {
    chain: Chain,
    queue: Arc<BlockQueue>,
    processor: Arc<BlockProcessor<MemoryStore>>,
    controller: Arc<SyncController>,
    start_block: u64,
}

struct NodeComponents {
    store: Arc<MemoryStore>,
    pipelines: Vec<ChainPipeline>,
    mint_worker: Option<Arc<MintQueueWorker<MemoryStore>>>,
    consensus: Option<Arc<ConsensusChecker<MemoryStore>>>,
    safety_margin: u64,
    restart_delay: Duration,
}

pub async fn run_indexer_node(
    config: IndexerNodeConfig,
    registry: Registry,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let metrics = Arc::new(IndexerMetrics::new(&registry));
    let store = Arc::new(MemoryStore::new());

    if let Some(path) = &config.collection_path {
        let items: Vec<CollectionItem> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        info!("registering {} collection items from {:?}", items.len(), path);
        for item in items {
            store.register_collection_item(item).await?;
        }
    }

    let l1_client = Arc::new(
        EthChainClient::new(
            Chain::L1,
            &config.l1.rpc_url,
            config.l1.chain_id,
            config.l1.points_address,
            config.l1.registry_address,
        )
        .await?,
    );
    let l1_reader: Arc<dyn ChainReader> = l1_client.clone();
    let points_reader: Option<Arc<dyn PointsReader>> = config
        .l1
        .points_address
        .map(|_| l1_client.clone() as Arc<dyn PointsReader>);

    let l1_queue = Arc::new(BlockQueue::new(
        Chain::L1,
        Duration::from_millis(config.queue.retry_base_delay_ms),
        config.queue.max_retries,
        metrics.clone(),
    ));
    let l1_processor = Arc::new(BlockProcessor::new(
        Chain::L1,
        store.clone(),
        l1_reader.clone(),
        points_reader,
        ProcessorContracts {
            marketplace: config.l1.marketplace_address,
            points: config.l1.points_address,
            bridge_l1: config.l1.bridge_address,
            collection_l2: None,
        },
        metrics.clone(),
    ));
    let l1_controller = Arc::new(SyncController::new(
        Chain::L1,
        l1_reader,
        l1_queue.clone(),
        Duration::from_millis(config.l1.poll_interval_ms),
    ));

    let mut pipelines = vec![ChainPipeline {
        chain: Chain::L1,
        queue: l1_queue,
        processor: l1_processor,
        controller: l1_controller,
        start_block: config.l1.start_block,
    }];

    let mut mint_worker = None;
    if let Some(l2) = &config.l2 {
        let (pipeline, worker) =
            build_l2(l2, &config, store.clone(), metrics.clone()).await?;
        pipelines.push(pipeline);
        mint_worker = Some(worker);
    }

    let consensus = config.l1.registry_address.map(|_| {
        Arc::new(ConsensusChecker::new(
            store.clone(),
            l1_client.clone() as Arc<dyn OwnershipOracle>,
            metrics.clone(),
            Duration::from_secs(config.consensus_interval_secs),
        ))
    });

    let server_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.server_listen_port,
    );
    let admin_chains = pipelines
        .iter()
        .map(|pipeline| server::ChainAdmin {
            chain: pipeline.chain,
            queue: pipeline.queue.clone(),
            processor: pipeline.processor.clone(),
        })
        .collect();
    let _server_handle = server::run_server(
        &server_address,
        Arc::new(AppState {
            chains: admin_chains,
            registry,
        }),
    );
    info!("admin server listening on {}", server_address);

    start_uptime_task(metrics);

    let components = NodeComponents {
        store,
        pipelines,
        mint_worker,
        consensus,
        safety_margin: config.queue.safety_margin,
        restart_delay: Duration::from_secs(config.restart_delay_secs),
    };
    Ok(tokio::spawn(supervise(components)))
}

async fn build_l2(
    l2: &L2Config,
    config: &IndexerNodeConfig,
    store: Arc<MemoryStore>,
    metrics: Arc<IndexerMetrics>,
) -> anyhow::Result<(ChainPipeline, Arc<MintQueueWorker<MemoryStore>>)> {
    let l2_client = Arc::new(
        EthChainClient::new(Chain::L2, &l2.rpc_url, l2.chain_id, None, None).await?,
    );
    let l2_reader: Arc<dyn ChainReader> = l2_client;

    let queue = Arc::new(BlockQueue::new(
        Chain::L2,
        Duration::from_millis(config.queue.retry_base_delay_ms),
        config.queue.max_retries,
        metrics.clone(),
    ));
    let processor = Arc::new(BlockProcessor::new(
        Chain::L2,
        store.clone(),
        l2_reader.clone(),
        None,
        ProcessorContracts {
            collection_l2: Some(l2.collection_address),
            ..Default::default()
        },
        metrics.clone(),
    ));
    let controller = Arc::new(SyncController::new(
        Chain::L2,
        l2_reader,
        queue.clone(),
        Duration::from_millis(l2.poll_interval_ms),
    ));

    let key_hex = std::fs::read_to_string(&l2.relayer_key_path)?;
    let wallet: LocalWallet = key_hex.trim().parse()?;
    let wallet = wallet.with_chain_id(l2.chain_id);
    info!("[l2] relayer address {:#x}", wallet.address());
    let signer = Arc::new(SignerMiddleware::new(
        Provider::<Http>::try_from(l2.rpc_url.as_str())?,
        wallet,
    ));
    let submitter: Arc<dyn MintSubmitter> =
        Arc::new(EthMintSubmitter::new(signer, l2.collection_address));
    let mint_worker = Arc::new(MintQueueWorker::new(
        store,
        submitter,
        metrics,
        Duration::from_millis(config.mint.pace_ms),
        config.mint.max_attempts,
    ));

    Ok((
        ChainPipeline {
            chain: Chain::L2,
            queue,
            processor,
            controller,
            start_block: l2.start_block,
        },
        mint_worker,
    ))
}

fn start_uptime_task(metrics: Arc<IndexerMetrics>) {
    let started = Instant::now();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            metrics.uptime.set(started.elapsed().as_secs() as i64);
        }
    });
}

async fn supervise(components: NodeComponents) {
    loop {
        match run_pipelines(&components).await {
            Ok(()) => {
                info!("indexer pipelines stopped cleanly");
                return;
            }
            Err(e) if e.is_terminal() => {
                error!("indexer stopped on terminal error: {}", e);
                return;
            }
            Err(e) => {
                warn!(
                    "indexer pipeline failed ({}), restarting in {:?}",
                    e, components.restart_delay
                );
                tokio::time::sleep(components.restart_delay).await;
            }
        }
    }
}

/// Resume point for a chain: the checkpoint minus the safety margin, clamped
/// to the configured collection start block.
async fn resolve_start_block<S: Store>(
    store: &S,
    chain: Chain,
    configured_start: u64,
    safety_margin: u64,
) -> IndexerResult<u64> {
    let checkpoint = store.checkpoint(chain).await?;
    Ok(match checkpoint {
        Some(cp) => cp.block_number.saturating_sub(safety_margin).max(configured_start),
        None => configured_start,
    })
}

async fn run_pipelines(components: &NodeComponents) -> IndexerResult<()> {
    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<IndexerResult<()>> = JoinSet::new();

    for pipeline in &components.pipelines {
        let start = resolve_start_block(
            components.store.as_ref(),
            pipeline.chain,
            pipeline.start_block,
            components.safety_margin,
        )
        .await?;
        info!("[{}] starting pipeline from block {}", pipeline.chain, start);

        let queue = pipeline.queue.clone();
        let handler: Arc<dyn BlockHandler> = pipeline.processor.clone();
        let queue_cancel = cancel.clone();
        tasks.spawn(async move { queue.run(handler, queue_cancel).await });

        let controller = pipeline.controller.clone();
        let controller_cancel = cancel.clone();
        tasks.spawn(async move { controller.run(start, controller_cancel).await });
    }

    if let Some(worker) = &components.mint_worker {
        let worker = worker.clone();
        let worker_cancel = cancel.clone();
        tasks.spawn(async move { worker.run(worker_cancel).await });
    }

    if let Some(checker) = &components.consensus {
        let checker = checker.clone();
        let checker_cancel = cancel.clone();
        tasks.spawn(async move { checker.run(checker_cancel).await });
    }

    // First failure wins; everything else is cancelled and drained
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {
                if !cancel.is_cancelled() {
                    // A component returned without being asked to stop;
                    // treat it as a restartable fault
                    cancel.cancel();
                }
            }
            Ok(Err(e)) => {
                if result.is_ok() {
                    result = Err(e);
                }
                cancel.cancel();
            }
            Err(e) => {
                if result.is_ok() {
                    result = Err(crate::error::IndexerError::Generic(format!(
                        "task panicked: {}",
                        e
                    )));
                }
                cancel.cancel();
            }
        }
    }
    result
}
