// Copyright (c) EtherPhunks, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC access to the two chains.
//!
//! [`ChainReader`] is the read boundary the processor and controller depend
//! on; [`EthChainClient`] is the production implementation over an ethers
//! provider. Tests substitute in-memory readers.

use crate::error::{IndexerError, IndexerResult};
use crate::types::Chain;
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, Bytes, Eip1559TransactionRequest, Transaction, TransactionReceipt, H256,
    U256,
};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::info;

/// A transaction paired with its receipt. The receipt carries the status flag
/// and the logs the classifier matches against.
#[derive(Debug, Clone)]
pub struct TransactionWithReceipt {
    pub tx: Transaction,
    pub receipt: TransactionReceipt,
}

impl TransactionWithReceipt {
    pub fn succeeded(&self) -> bool {
        self.receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false)
    }
}

/// A block with its transactions and their receipts, ordered by
/// transaction index.
#[derive(Debug, Clone)]
pub struct FullBlock {
    pub number: u64,
    pub hash: H256,
    pub timestamp: u64,
    pub transactions: Vec<TransactionWithReceipt>,
}

#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    async fn latest_block_number(&self) -> IndexerResult<u64>;
    async fn full_block(&self, block_num: u64) -> IndexerResult<FullBlock>;
    async fn full_transaction(&self, tx_hash: H256) -> IndexerResult<TransactionWithReceipt>;
}

/// Read access to the points contract. The indexer never trusts event deltas;
/// it re-reads the total through this trait.
#[async_trait]
pub trait PointsReader: Send + Sync + 'static {
    async fn current_points(&self, user: Address) -> IndexerResult<U256>;
}

static POINTS_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let hash = keccak256("points(address)".as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
});

static OWNER_OF_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let hash = keccak256("ownerOfEthscription(bytes32)".as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
});

static MINT_BRIDGED_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let hash = keccak256("mintBridged(address,uint256,bytes32,string)".as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
});

pub struct EthChainClient<P> {
    provider: Provider<P>,
    chain: Chain,
    points_contract: Option<Address>,
    registry_contract: Option<Address>,
}

impl EthChainClient<Http> {
    pub async fn new(
        chain: Chain,
        rpc_url: &str,
        expected_chain_id: u64,
        points_contract: Option<Address>,
        registry_contract: Option<Address>,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        let client = Self {
            provider,
            chain,
            points_contract,
            registry_contract,
        };
        client.describe(expected_chain_id).await?;
        Ok(client)
    }
}

impl<P: JsonRpcClient + 'static> EthChainClient<P> {
    /// Sanity-checks the RPC endpoint against the configured chain id and
    /// logs what we are connected to.
    async fn describe(&self, expected_chain_id: u64) -> anyhow::Result<()> {
        let chain_id = self.provider.get_chainid().await?.as_u64();
        if chain_id != expected_chain_id {
            anyhow::bail!(
                "[{}] rpc endpoint reports chain id {} but config expects {}",
                self.chain,
                chain_id,
                expected_chain_id
            );
        }
        let block_number = self.provider.get_block_number().await?;
        info!(
            "[{}] connected to chain id {}, block height {}",
            self.chain, chain_id, block_number
        );
        Ok(())
    }

    fn transient<E: std::fmt::Display>(&self, context: &str, e: E) -> IndexerError {
        IndexerError::TransientProviderError(format!("[{}] {}: {}", self.chain, context, e))
    }

    async fn receipt(&self, tx_hash: H256) -> IndexerResult<TransactionReceipt> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.transient("get_transaction_receipt", e))?
            .ok_or(IndexerError::TxNotFound)
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainReader for EthChainClient<P> {
    async fn latest_block_number(&self) -> IndexerResult<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.transient("get_block_number", e))?
            .as_u64())
    }

    async fn full_block(&self, block_num: u64) -> IndexerResult<FullBlock> {
        let block = self
            .provider
            .get_block_with_txs(block_num)
            .await
            .map_err(|e| self.transient("get_block_with_txs", e))?
            .ok_or(IndexerError::BlockNotFound(block_num))?;
        let hash = block.hash.ok_or(IndexerError::BlockNotFound(block_num))?;

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for tx in block.transactions {
            let receipt = self.receipt(tx.hash).await?;
            transactions.push(TransactionWithReceipt { tx, receipt });
        }
        Ok(FullBlock {
            number: block_num,
            hash,
            timestamp: block.timestamp.as_u64(),
            transactions,
        })
    }

    async fn full_transaction(&self, tx_hash: H256) -> IndexerResult<TransactionWithReceipt> {
        let tx = self
            .provider
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.transient("get_transaction", e))?
            .ok_or(IndexerError::TxNotFound)?;
        let receipt = self.receipt(tx_hash).await?;
        Ok(TransactionWithReceipt { tx, receipt })
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> PointsReader for EthChainClient<P> {
    async fn current_points(&self, user: Address) -> IndexerResult<U256> {
        let contract = self.points_contract.ok_or_else(|| {
            IndexerError::InvalidConfig("points contract address not configured".to_string())
        })?;
        let mut data = POINTS_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::Address(user)]));
        let call = TypedTransaction::Eip1559(
            Eip1559TransactionRequest::new()
                .to(contract)
                .data(Bytes::from(data)),
        );
        let raw = self
            .provider
            .call(&call, None::<BlockId>)
            .await
            .map_err(|e| self.transient("points call", e))?;
        let tokens = abi::decode(&[ParamType::Uint(256)], &raw)
            .map_err(|e| IndexerError::AbiDecodeError(format!("points return: {}", e)))?;
        tokens[0]
            .clone()
            .into_uint()
            .ok_or_else(|| IndexerError::AbiDecodeError("points return".to_string()))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> crate::consensus::OwnershipOracle for EthChainClient<P> {
    async fn owner_of(&self, hash_id: &H256) -> IndexerResult<Option<Address>> {
        let contract = self.registry_contract.ok_or_else(|| {
            IndexerError::InvalidConfig("registry contract address not configured".to_string())
        })?;
        let mut data = OWNER_OF_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::FixedBytes(hash_id.as_bytes().to_vec())]));
        let call = TypedTransaction::Eip1559(
            Eip1559TransactionRequest::new()
                .to(contract)
                .data(Bytes::from(data)),
        );
        let raw = self
            .provider
            .call(&call, None::<BlockId>)
            .await
            .map_err(|e| self.transient("ownerOfEthscription call", e))?;
        let tokens = abi::decode(&[ParamType::Address], &raw)
            .map_err(|e| IndexerError::AbiDecodeError(format!("ownerOf return: {}", e)))?;
        let owner = tokens[0]
            .clone()
            .into_address()
            .ok_or_else(|| IndexerError::AbiDecodeError("ownerOf return".to_string()))?;
        Ok(if owner.is_zero() { None } else { Some(owner) })
    }
}

/// Fully encoded calldata for the L2 mint contract. Argument order is part of
/// the contract: `(owner, tokenId, hashId, metadata)`.
pub fn encode_mint_call(
    owner: Address,
    token_id: U256,
    hash_id: H256,
    metadata: &str,
) -> Bytes {
    let mut data = MINT_BRIDGED_SELECTOR.to_vec();
    data.extend(abi::encode(&[
        Token::Address(owner),
        Token::Uint(token_id),
        Token::FixedBytes(hash_id.as_bytes().to_vec()),
        Token::String(metadata.to_string()),
    ]));
    Bytes::from(data)
}

/// Submits L2 mint transactions. Split out as a trait so the mint queue can
/// be tested without a signer or an RPC endpoint.
#[async_trait]
pub trait MintSubmitter: Send + Sync + 'static {
    /// Dry-run the mint via `eth_call`.
    async fn simulate_mint(
        &self,
        owner: Address,
        token_id: U256,
        hash_id: H256,
        metadata: &str,
    ) -> IndexerResult<()>;

    /// Send the mint transaction and wait for a successful receipt.
    async fn submit_mint(
        &self,
        owner: Address,
        token_id: U256,
        hash_id: H256,
        metadata: &str,
    ) -> IndexerResult<H256>;
}

pub struct EthMintSubmitter<M> {
    client: Arc<M>,
    mint_contract: Address,
}

impl<M: Middleware + 'static> EthMintSubmitter<M> {
    pub fn new(client: Arc<M>, mint_contract: Address) -> Self {
        Self {
            client,
            mint_contract,
        }
    }

    fn call_request(
        &self,
        owner: Address,
        token_id: U256,
        hash_id: H256,
        metadata: &str,
    ) -> TypedTransaction {
        TypedTransaction::Eip1559(
            Eip1559TransactionRequest::new()
                .to(self.mint_contract)
                .data(encode_mint_call(owner, token_id, hash_id, metadata)),
        )
    }
}

#[async_trait]
impl<M: Middleware + 'static> MintSubmitter for EthMintSubmitter<M> {
    async fn simulate_mint(
        &self,
        owner: Address,
        token_id: U256,
        hash_id: H256,
        metadata: &str,
    ) -> IndexerResult<()> {
        let call = self.call_request(owner, token_id, hash_id, metadata);
        self.client
            .call(&call, None::<BlockId>)
            .await
            .map_err(|e| IndexerError::MintSimulationFailed(format!("{:#x}: {}", hash_id, e)))?;
        Ok(())
    }

    async fn submit_mint(
        &self,
        owner: Address,
        token_id: U256,
        hash_id: H256,
        metadata: &str,
    ) -> IndexerResult<H256> {
        let call = self.call_request(owner, token_id, hash_id, metadata);
        let pending = self
            .client
            .send_transaction(call, None)
            .await
            .map_err(|e| IndexerError::MintSubmissionFailed(format!("{:#x}: {}", hash_id, e)))?;
        let receipt = pending
            .await
            .map_err(|e| IndexerError::MintSubmissionFailed(format!("{:#x}: {}", hash_id, e)))?
            .ok_or_else(|| {
                IndexerError::MintSubmissionFailed(format!("{:#x}: transaction dropped", hash_id))
            })?;
        if receipt.status.map(|s| s.as_u64()) != Some(1) {
            return Err(IndexerError::MintSubmissionFailed(format!(
                "{:#x}: mint transaction {:#x} reverted",
                hash_id, receipt.transaction_hash
            )));
        }
        Ok(receipt.transaction_hash)
    }
}
