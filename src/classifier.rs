// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pure transaction-shape analysis.
//!
//! Everything here is a function of the transaction bytes alone. Whether a
//! candidate actually applies (allow-list membership, dedup, ownership) is
//! decided by the processor against storage.

use ethers::types::Transaction;
use sha2::{Digest, Sha256};

pub const SVG_DATA_URI_PREFIX: &str = "data:image/svg+xml,";
pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// A creation candidate: the calldata decoded as a supported content URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationCandidate {
    pub content_uri: String,
    /// Lowercase hex sha-256 of the full content URI
    pub sha: String,
}

/// What a transaction's calldata looks like, before any storage lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputShape {
    /// Valid data-URI calldata; may create an ethscription
    Creation(CreationCandidate),
    /// Exactly 32 bytes; may be a single ethscription transfer
    SingleTransfer([u8; 32]),
    /// A positive multiple of 32 bytes; may be a batch transfer
    BatchTransfer(Vec<[u8; 32]>),
    /// None of the above
    Other,
}

/// Decodes calldata into a content URI. NUL bytes are stripped before UTF-8
/// decoding because some inscription tooling pads calldata.
pub fn decode_content_uri(input: &[u8]) -> Option<String> {
    let stripped: Vec<u8> = input.iter().copied().filter(|b| *b != 0).collect();
    let uri = String::from_utf8(stripped).ok()?;
    if uri.starts_with(SVG_DATA_URI_PREFIX) || uri.starts_with(PNG_DATA_URI_PREFIX) {
        Some(uri)
    } else {
        None
    }
}

pub fn content_sha(content_uri: &str) -> String {
    hex::encode(Sha256::digest(content_uri.as_bytes()))
}

/// Classifies raw calldata. Precedence: creation, then single transfer, then
/// batch. A 32-byte input that happens to decode as a data URI cannot occur
/// (the prefixes are longer than what 32 non-NUL bytes of a hash would yield),
/// so the arms are disjoint in practice.
pub fn classify_input(input: &[u8]) -> InputShape {
    if let Some(content_uri) = decode_content_uri(input) {
        let sha = content_sha(&content_uri);
        return InputShape::Creation(CreationCandidate { content_uri, sha });
    }
    if input.len() == 32 {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(input);
        return InputShape::SingleTransfer(hash);
    }
    if !input.is_empty() && input.len() % 32 == 0 {
        let segments = input
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        return InputShape::BatchTransfer(segments);
    }
    InputShape::Other
}

pub fn classify_transaction(tx: &Transaction) -> InputShape {
    classify_input(&tx.input)
}
