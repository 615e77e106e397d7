// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    // The referenced transaction does not exist
    TxNotFound,
    // The referenced block does not exist (yet)
    BlockNotFound(u64),
    // Backfill was asked to start past the current chain head
    BackfillBeyondHead { from: u64, latest: u64 },
    // A block exhausted its retry budget and parked the queue
    StuckBlock { chain: &'static str, block: u64 },
    // Transient RPC/provider error, safe to retry
    TransientProviderError(String),
    // Non-transient RPC/provider error
    ProviderError(String),
    // Failure to decode a log against a known event signature
    AbiDecodeError(String),
    // Storage collaborator error
    StorageError(String),
    // Mint simulation reverted
    MintSimulationFailed(String),
    // Mint submission failed or the transaction reverted on chain
    MintSubmissionFailed(String),
    // Indexed state diverged from chain state
    ConsistencyViolation(String),
    // Invalid configuration
    InvalidConfig(String),
    // Rest API error
    RestAPIError(String),
    // Uncategorized error
    Generic(String),
}

impl IndexerError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            IndexerError::TxNotFound => "tx_not_found",
            IndexerError::BlockNotFound(_) => "block_not_found",
            IndexerError::BackfillBeyondHead { .. } => "backfill_beyond_head",
            IndexerError::StuckBlock { .. } => "stuck_block",
            IndexerError::TransientProviderError(_) => "transient_provider_error",
            IndexerError::ProviderError(_) => "provider_error",
            IndexerError::AbiDecodeError(_) => "abi_decode_error",
            IndexerError::StorageError(_) => "storage_error",
            IndexerError::MintSimulationFailed(_) => "mint_simulation_failed",
            IndexerError::MintSubmissionFailed(_) => "mint_submission_failed",
            IndexerError::ConsistencyViolation(_) => "consistency_violation",
            IndexerError::InvalidConfig(_) => "invalid_config",
            IndexerError::RestAPIError(_) => "rest_api_error",
            IndexerError::Generic(_) => "generic",
        }
    }

    /// Whether the whole-pipeline restart loop should give up instead of retrying
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexerError::StuckBlock { .. })
    }
}

impl std::fmt::Display for IndexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerError::BackfillBeyondHead { from, latest } => {
                write!(
                    f,
                    "backfill start block {} is beyond chain head {}",
                    from, latest
                )
            }
            IndexerError::StuckBlock { chain, block } => {
                write!(
                    f,
                    "[{}] block {} exhausted retries, queue parked",
                    chain, block
                )
            }
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for IndexerError {}

pub type IndexerResult<T> = Result<T, IndexerError>;
