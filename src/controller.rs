// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Feeds the block queue from two sources: a one-shot historical backfill and
//! a head-polling loop that replays any blocks missed between ticks. The
//! startup sequence is clear, pause, backfill, resume, poll; pausing during
//! the backfill keeps the poller from racing ahead of the historical range.

use crate::block_queue::BlockQueue;
use crate::chain_client::ChainReader;
use crate::error::{IndexerError, IndexerResult};
use crate::types::Chain;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct SyncController {
    chain: Chain,
    reader: Arc<dyn ChainReader>,
    queue: Arc<BlockQueue>,
    poll_interval: Duration,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SyncController {
    pub fn new(
        chain: Chain,
        reader: Arc<dyn ChainReader>,
        queue: Arc<BlockQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain,
            reader,
            queue,
            poll_interval,
        }
    }

    /// Enqueues every block from `from` up to (not including) the current
    /// head and returns the head. Fails fast when `from` is past the head.
    pub async fn start_backfill(&self, from: u64) -> IndexerResult<u64> {
        let latest = self.reader.latest_block_number().await?;
        if from > latest {
            return Err(IndexerError::BackfillBeyondHead { from, latest });
        }
        info!(
            "[{}] backfilling blocks {}..{} ({} blocks)",
            self.chain,
            from,
            latest,
            latest - from
        );
        for block_num in from..latest {
            self.queue.enqueue(block_num, unix_now()).await;
        }
        Ok(latest)
    }

    /// Startup sequence, then the live polling loop. Returns `Ok(())` only on
    /// cancellation; any polling error propagates for a whole-node restart.
    pub async fn run(&self, start_from: u64, cancel: CancellationToken) -> IndexerResult<()> {
        self.queue.clear().await;
        self.queue.pause().await;
        let head = self.start_backfill(start_from).await?;
        self.queue.resume().await;
        self.poll(head, cancel).await
    }

    /// Polls the chain head and enqueues every block from `next` upward, so
    /// blocks missed during an RPC gap are replayed rather than skipped.
    async fn poll(&self, mut next: u64, cancel: CancellationToken) -> IndexerResult<()> {
        info!("[{}] polling for new blocks from {}", self.chain, next);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] poll loop cancelled", self.chain);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let latest = crate::retry_with_max_elapsed_time!(
                self.reader.latest_block_number(),
                Duration::from_secs(120)
            )??;
            while next <= latest {
                debug!("[{}] new block {}", self.chain, next);
                self.queue.enqueue(next, unix_now()).await;
                next += 1;
            }
        }
    }
}
