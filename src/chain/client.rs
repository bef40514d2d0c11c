//! Chain client boundary: the RPC operations the pipeline needs, with
//! classified errors the broadcaster and confirmer branch on.

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use futures::future::join_all;
use std::collections::HashMap;
use thiserror::Error;

/// Classified outcome of a failed chain call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("transient RPC failure: {0}")]
    Transient(String),

    #[error("transaction underpriced: {0}")]
    Underpriced(String),

    #[error("nonce too low: {0}")]
    NonceTooLow(String),

    #[error("transaction already known: {0}")]
    AlreadyKnown(String),

    #[error("rejected by chain: {0}")]
    Fatal(String),
}

impl ChainError {
    /// Classify a node error message
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["nonce too low", "nonce has already been used", "invalid nonce"]) {
            ChainError::NonceTooLow(message.to_string())
        } else if has(&["already known", "known transaction", "already imported"]) {
            ChainError::AlreadyKnown(message.to_string())
        } else if has(&[
            "underpriced",
            "fee too low",
            "gas price too low",
            "less than block base fee",
            "feecap below",
        ]) {
            ChainError::Underpriced(message.to_string())
        } else if has(&[
            "insufficient funds",
            "intrinsic gas too low",
            "exceeds block gas limit",
            "invalid sender",
            "oversized data",
            "tx type not supported",
            "invalid signature",
            "max priority fee per gas higher than max fee per gas",
            "execution reverted",
        ]) {
            ChainError::Fatal(message.to_string())
        } else {
            ChainError::Transient(message.to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Transient(_) | ChainError::Underpriced(_))
    }
}

/// A chain head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub number: u64,
    pub hash: H256,
}

/// Receipt fields the confirmer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
}

/// RPC operations required from a chain endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<(), ChainError>;

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, ChainError>;

    async fn head(&self) -> Result<Head, ChainError>;

    /// Canonical block hash at a height, `None` past the tip
    async fn block_hash(&self, number: u64) -> Result<Option<H256>, ChainError>;

    async fn finalized_block_number(&self) -> Result<u64, ChainError>;

    /// Next nonce for an address, counting pending transactions
    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError>;
}

/// Fetch receipts in chunks of `batch_size`, each chunk concurrently
pub async fn fetch_receipts(
    client: &dyn ChainClient,
    hashes: &[H256],
    batch_size: usize,
) -> Result<HashMap<H256, ReceiptInfo>, ChainError> {
    let mut receipts = HashMap::new();

    for chunk in hashes.chunks(batch_size.max(1)) {
        let results = join_all(chunk.iter().map(|h| client.transaction_receipt(*h))).await;
        for result in results {
            if let Some(receipt) = result? {
                receipts.insert(receipt.tx_hash, receipt);
            }
        }
    }

    Ok(receipts)
}
