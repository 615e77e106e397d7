// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry,
};

const BLOCK_PROCESSING_SEC_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0,
];

#[derive(Clone, Debug)]
pub struct IndexerMetrics {
    pub(crate) uptime: IntGauge,

    pub(crate) last_synced_block: IntGaugeVec,
    pub(crate) blocks_processed: IntCounterVec,
    pub(crate) block_processing_duration: Histogram,

    pub(crate) events_indexed: IntCounterVec,
    pub(crate) dropped_transfers: IntCounter,

    pub(crate) queue_depth: IntGaugeVec,
    pub(crate) queue_retries: IntCounterVec,
    pub(crate) queue_stuck: IntGaugeVec,

    pub(crate) bridge_transitions: IntCounterVec,
    pub(crate) mint_queue_depth: IntGauge,
    pub(crate) mints_submitted: IntCounter,
    pub(crate) mints_failed: IntCounter,

    pub(crate) consistency_violations: IntCounter,
    pub(crate) errors: IntCounterVec,
}

impl IndexerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            uptime: register_int_gauge_with_registry!(
                "server_uptime_seconds",
                "Uptime of the indexer node in seconds",
                registry,
            )
            .unwrap(),
            last_synced_block: register_int_gauge_vec_with_registry!(
                "indexer_last_synced_block",
                "Highest fully processed block per chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            blocks_processed: register_int_counter_vec_with_registry!(
                "indexer_blocks_processed_total",
                "Blocks fully processed per chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            block_processing_duration: register_histogram_with_registry!(
                "indexer_block_processing_duration_sec",
                "Time spent processing one block",
                BLOCK_PROCESSING_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            events_indexed: register_int_counter_vec_with_registry!(
                "indexer_events_indexed_total",
                "Audit-log events appended, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            dropped_transfers: register_int_counter_with_registry!(
                "indexer_dropped_transfers_total",
                "Transfer candidates dropped because the sender is not the owner",
                registry,
            )
            .unwrap(),
            queue_depth: register_int_gauge_vec_with_registry!(
                "indexer_block_queue_depth",
                "Jobs waiting in the block queue per chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            queue_retries: register_int_counter_vec_with_registry!(
                "indexer_block_queue_retries_total",
                "Block jobs retried after a processing failure",
                &["chain"],
                registry,
            )
            .unwrap(),
            queue_stuck: register_int_gauge_vec_with_registry!(
                "indexer_block_queue_stuck",
                "1 when the queue is parked on a block that exhausted retries",
                &["chain"],
                registry,
            )
            .unwrap(),
            bridge_transitions: register_int_counter_vec_with_registry!(
                "indexer_bridge_transitions_total",
                "Bridge state machine transitions, by resulting state",
                &["state"],
                registry,
            )
            .unwrap(),
            mint_queue_depth: register_int_gauge_with_registry!(
                "indexer_mint_queue_depth",
                "Pending L2 mint jobs",
                registry,
            )
            .unwrap(),
            mints_submitted: register_int_counter_with_registry!(
                "indexer_mints_submitted_total",
                "Mint transactions successfully submitted to L2",
                registry,
            )
            .unwrap(),
            mints_failed: register_int_counter_with_registry!(
                "indexer_mints_failed_total",
                "Mint jobs parked after exhausting their attempts",
                registry,
            )
            .unwrap(),
            consistency_violations: register_int_counter_with_registry!(
                "indexer_consistency_violations_total",
                "Observed divergences between indexed state and chain state",
                registry,
            )
            .unwrap(),
            errors: register_int_counter_vec_with_registry!(
                "indexer_errors_total",
                "Errors by type",
                &["type"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
