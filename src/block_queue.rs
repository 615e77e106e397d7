// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ordered, single-flight block job queue.
//!
//! One worker per chain drains jobs in ascending block number, one at a time.
//! Enqueueing a block that is already queued replaces the job instead of
//! duplicating it. On a processing failure the queue pauses, retries the same
//! block with bounded exponential backoff, and resumes on success; exhausting
//! the retry budget parks the queue in a terminal stuck state that surfaces
//! through metrics, `job_counts` and the worker's return value.

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::IndexerMetrics;
use crate::types::{Chain, QueueJob};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[async_trait]
pub trait BlockHandler: Send + Sync + 'static {
    async fn handle_block(&self, block_num: u64) -> IndexerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub paused: bool,
    pub stuck: bool,
}

#[derive(Default)]
struct QueueInner {
    jobs: BTreeMap<u64, QueueJob>,
    active: Option<u64>,
    paused: bool,
    stuck: bool,
}

pub struct BlockQueue {
    chain: Chain,
    inner: Mutex<QueueInner>,
    notify: Notify,
    retry_base_delay: Duration,
    max_retries: u32,
    metrics: Arc<IndexerMetrics>,
}

impl BlockQueue {
    pub fn new(
        chain: Chain,
        retry_base_delay: Duration,
        max_retries: u32,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            chain,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            retry_base_delay,
            max_retries,
            metrics,
        }
    }

    /// Adds a job for `block_num`, replacing any queued job for the same
    /// block.
    pub async fn enqueue(&self, block_num: u64, timestamp: u64) {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(
            block_num,
            QueueJob::new(self.chain, block_num, timestamp, self.max_retries),
        );
        self.set_depth(&inner);
        drop(inner);
        self.notify.notify_one();
    }

    pub async fn pause(&self) {
        self.inner.lock().await.paused = true;
        info!("[{}] block queue paused", self.chain);
    }

    pub async fn resume(&self) {
        self.inner.lock().await.paused = false;
        info!("[{}] block queue resumed", self.chain);
        self.notify.notify_one();
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.jobs.clear();
        inner.stuck = false;
        self.set_depth(&inner);
        self.metrics
            .queue_stuck
            .with_label_values(&[self.chain.as_str()])
            .set(0);
    }

    pub async fn job_counts(&self) -> JobCounts {
        let inner = self.inner.lock().await;
        JobCounts {
            waiting: inner.jobs.len(),
            active: usize::from(inner.active.is_some()),
            paused: inner.paused,
            stuck: inner.stuck,
        }
    }

    fn set_depth(&self, inner: &QueueInner) {
        self.metrics
            .queue_depth
            .with_label_values(&[self.chain.as_str()])
            .set(inner.jobs.len() as i64);
    }

    /// Takes the lowest queued block if the queue is runnable.
    async fn take_next(&self) -> Option<QueueJob> {
        let mut inner = self.inner.lock().await;
        if inner.paused || inner.stuck {
            return None;
        }
        let block_num = *inner.jobs.keys().next()?;
        let job = inner.jobs.remove(&block_num);
        inner.active = Some(block_num);
        self.set_depth(&inner);
        job
    }

    async fn finish_active(&self) {
        self.inner.lock().await.active = None;
    }

    /// Drains the queue until cancelled. Returns `Err(StuckBlock)` when a
    /// block exhausts its retry budget.
    pub async fn run(
        &self,
        handler: Arc<dyn BlockHandler>,
        cancel: CancellationToken,
    ) -> IndexerResult<()> {
        loop {
            let Some(mut job) = self.take_next().await else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.notify.notified() => continue,
                }
            };

            let result = self.process_with_retries(&handler, &mut job, &cancel).await;
            self.finish_active().await;
            match result {
                Ok(()) => {}
                Err(e) if cancel.is_cancelled() => {
                    // Shutting down; put the job back so a restart resumes it
                    self.enqueue(job.block_num, job.timestamp).await;
                    warn!(
                        "[{}] cancelled while processing block {}: {}",
                        self.chain, job.block_num, e
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.mark_stuck(&job).await;
                    return Err(e);
                }
            }
        }
    }

    async fn process_with_retries(
        &self,
        handler: &Arc<dyn BlockHandler>,
        job: &mut QueueJob,
        cancel: &CancellationToken,
    ) -> IndexerResult<()> {
        loop {
            match handler.handle_block(job.block_num).await {
                Ok(()) => {
                    if job.retry_count > 0 {
                        self.resume().await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.metrics
                        .errors
                        .with_label_values(&[e.error_type()])
                        .inc();
                    if job.retry_count >= job.max_retries {
                        return Err(IndexerError::StuckBlock {
                            chain: self.chain.as_str(),
                            block: job.block_num,
                        });
                    }
                    if job.retry_count == 0 {
                        self.pause().await;
                    }
                    job.retry_count += 1;
                    self.metrics
                        .queue_retries
                        .with_label_values(&[self.chain.as_str()])
                        .inc();
                    let delay = self
                        .retry_base_delay
                        .saturating_mul(1u32 << job.retry_count.min(16))
                        .min(MAX_RETRY_DELAY);
                    warn!(
                        "[{}] block {} failed ({}), retry {}/{} in {:?}",
                        self.chain, job.block_num, e, job.retry_count, job.max_retries, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn mark_stuck(&self, job: &QueueJob) {
        let mut inner = self.inner.lock().await;
        inner.stuck = true;
        self.metrics
            .queue_stuck
            .with_label_values(&[self.chain.as_str()])
            .set(1);
        error!(
            "[{}] block {} exhausted {} retries; queue parked",
            self.chain, job.block_num, job.max_retries
        );
    }
}
