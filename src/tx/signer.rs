//! Transaction signing and typed-transaction assembly

use super::gas::GasPrice;
use crate::error::{TxmError, TxmResult};
use crate::state::Transaction;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use tracing::info;

/// Signed payload ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub raw: Bytes,
    pub hash: H256,
}

/// Key custody boundary
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn has_key(&self, address: Address) -> bool;

    fn addresses(&self) -> Vec<Address>;

    /// Sign for the transaction's `from` address
    async fn sign(&self, tx: &TypedTransaction) -> TxmResult<SignedTx>;
}

/// Signs with private keys held in process memory
pub struct LocalKeySigner {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeySigner {
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> TxmResult<Self> {
        let mut wallets = HashMap::new();
        for key in keys {
            let wallet = key
                .as_ref()
                .trim()
                .parse::<LocalWallet>()
                .map_err(|e| TxmError::Signing(format!("Invalid private key: {}", e)))?;
            wallets.insert(wallet.address(), wallet);
        }
        Ok(Self { wallets })
    }

    /// Load comma separated hex keys from an environment variable
    pub fn from_env(var: &str) -> TxmResult<Self> {
        let keys = std::env::var(var).map_err(|_| {
            TxmError::Config(format!("No signing keys configured. Set {}", var))
        })?;
        let keys: Vec<&str> = keys.split(',').filter(|k| !k.trim().is_empty()).collect();

        let signer = Self::from_keys(&keys)?;
        info!("Loaded {} signing keys from {}", signer.wallets.len(), var);
        Ok(signer)
    }
}

#[async_trait]
impl TxSigner for LocalKeySigner {
    fn has_key(&self, address: Address) -> bool {
        self.wallets.contains_key(&address)
    }

    fn addresses(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }

    async fn sign(&self, tx: &TypedTransaction) -> TxmResult<SignedTx> {
        let from = tx
            .from()
            .copied()
            .ok_or_else(|| TxmError::Signing("transaction has no sender".to_string()))?;
        let wallet = self
            .wallets
            .get(&from)
            .ok_or_else(|| TxmError::Signing(format!("no key for {:?}", from)))?;

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| TxmError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));

        Ok(SignedTx { raw, hash })
    }
}

/// Build the typed transaction for one attempt
pub fn build_transaction(
    tx: &Transaction,
    nonce: u64,
    gas_price: &GasPrice,
    gas_limit: u64,
) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TypedTransaction::Legacy(
            TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .value(tx.value)
                .data(tx.data.clone())
                .nonce(nonce)
                .gas(gas_limit)
                .gas_price(*price)
                .chain_id(tx.chain_id),
        ),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => TypedTransaction::Eip1559(
            Eip1559TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .value(tx.value)
                .data(tx.data.clone())
                .nonce(nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(tx.chain_id),
        ),
    }
}
