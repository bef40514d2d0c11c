//! State management and persistence
//!
//! Handles:
//! - Transaction and attempt persistence
//! - Nonce cursors for restart recovery
//! - Atomic, conditional state transitions
//! - Retention sweeps of terminal transactions

mod manager;
mod memory;
mod types;

pub use manager::PgTxStore;
pub use memory::MemoryTxStore;
pub use types::{
    Attempt, AttemptState, InFlight, NewAttempt, NewTransaction, NonceCursor, Receipt,
    Transaction, TransactionStats, TxRequest, TxState,
};

use crate::error::TxmResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use uuid::Uuid;

/// Persistent transaction store.
///
/// Every state transition is a single conditional update: it returns `false`
/// (and changes nothing) when the transaction is not in the expected state.
#[async_trait]
pub trait TxStore: Send + Sync {
    async fn insert_transaction(&self, new: NewTransaction) -> TxmResult<Transaction>;

    async fn get_transaction(&self, tx_id: Uuid) -> TxmResult<Option<Transaction>>;

    /// Attempts of a transaction, oldest first
    async fn attempts(&self, tx_id: Uuid) -> TxmResult<Vec<Attempt>>;

    async fn list_transactions(
        &self,
        chain_id: u64,
        state: Option<TxState>,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>>;

    /// Senders with at least one unstarted transaction
    async fn unstarted_senders(&self, chain_id: u64) -> TxmResult<Vec<Address>>;

    /// Oldest unstarted transactions of a sender
    async fn oldest_unstarted(
        &self,
        chain_id: u64,
        from: Address,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>>;

    /// Highest nonce assigned to a non-fatal transaction of the sender
    async fn max_assigned_nonce(&self, chain_id: u64, from: Address) -> TxmResult<Option<u64>>;

    async fn load_nonce_cursor(&self, chain_id: u64, address: Address)
        -> TxmResult<Option<NonceCursor>>;

    async fn save_nonce_cursor(&self, cursor: NonceCursor) -> TxmResult<()>;

    /// `unstarted -> broadcast` with the first active attempt
    async fn mark_broadcast(&self, tx_id: Uuid, attempt: NewAttempt) -> TxmResult<Option<Attempt>>;

    /// Supersede the active attempt of a `broadcast` transaction with a new one
    async fn replace_attempt(
        &self,
        tx_id: Uuid,
        superseded: Uuid,
        attempt: NewAttempt,
    ) -> TxmResult<Option<Attempt>>;

    /// Record the first head observed after an attempt's submission
    async fn set_broadcast_block(&self, attempt_id: Uuid, block_number: u64) -> TxmResult<()>;

    /// `broadcast -> confirmed`
    async fn mark_confirmed(&self, tx_id: Uuid, receipt: Receipt) -> TxmResult<bool>;

    /// `confirmed -> finalized`
    async fn mark_finalized(&self, tx_id: Uuid) -> TxmResult<bool>;

    /// `confirmed -> broadcast`, discarding the receipt
    async fn revert_to_broadcast(&self, tx_id: Uuid) -> TxmResult<bool>;

    /// Any non-terminal state `-> fatal`
    async fn mark_fatal(&self, tx_id: Uuid, reason: &str) -> TxmResult<bool>;

    /// `broadcast` and `confirmed` transactions with their attempts
    async fn in_flight(&self, chain_id: u64) -> TxmResult<Vec<InFlight>>;

    /// Delete up to `limit` terminal transactions last updated before `older_than`
    async fn reap(&self, chain_id: u64, older_than: DateTime<Utc>, limit: usize)
        -> TxmResult<u64>;

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats>;

    async fn health_check(&self) -> TxmResult<()>;
}
