//! Error types for the transaction manager

use crate::chain::ChainError;
use crate::tx::FeeError;

use thiserror::Error;

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Fee error: {0}")]
    Fee(#[from] FeeError),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Unknown sender {address} on chain {chain_id}")]
    UnknownSender { chain_id: u64, address: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TxmError::Chain(e) => e.is_retryable(),
            TxmError::Nonce { .. } | TxmError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxmError::Signing(_) | TxmError::Database(_) | TxmError::Config(_)
        )
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;
