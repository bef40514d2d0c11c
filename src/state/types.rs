//! Transaction, attempt and receipt records

use crate::tx::GasPrice;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    Broadcast,
    Confirmed,
    Finalized,
    Fatal,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Finalized | TxState::Fatal)
    }

    /// Whether a transaction in this state carries an active attempt
    pub fn has_active_attempt(&self) -> bool {
        matches!(self, TxState::Broadcast | TxState::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::Broadcast => "broadcast",
            TxState::Confirmed => "confirmed",
            TxState::Finalized => "finalized",
            TxState::Fatal => "fatal",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(TxState::Unstarted),
            "broadcast" => Ok(TxState::Broadcast),
            "confirmed" => Ok(TxState::Confirmed),
            "finalized" => Ok(TxState::Finalized),
            "fatal" => Ok(TxState::Fatal),
            other => Err(format!("unknown tx state {}", other)),
        }
    }
}

/// Attempt state; exactly one attempt per in-flight transaction is `Active`
/// and a terminal transaction has none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Active,
    Superseded,
    /// Retired when its transaction finalized or failed
    Closed,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Active => "active",
            AttemptState::Superseded => "superseded",
            AttemptState::Closed => "closed",
        }
    }
}

impl FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AttemptState::Active),
            "superseded" => Ok(AttemptState::Superseded),
            "closed" => Ok(AttemptState::Closed),
            other => Err(format!("unknown attempt state {}", other)),
        }
    }
}

/// A caller's request to deliver a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    pub gas_limit: Option<u64>,
}

/// Insert payload for a new transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub chain_id: u64,
    pub request: TxRequest,
}

/// Chain-observed outcome of an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
}

/// A logical unit of work owned by one chain's manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: Option<u64>,
    pub state: TxState,
    pub nonce: Option<u64>,
    pub receipt: Option<Receipt>,
    pub fatal_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new attempt
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub nonce: u64,
    pub gas_price: GasPrice,
    pub gas_limit: u64,
    pub tx_hash: H256,
    pub signed_raw: Bytes,
    /// Head number at submission, when known
    pub broadcast_block: Option<u64>,
}

/// One signed broadcast instance of a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub tx_id: Uuid,
    pub nonce: u64,
    pub gas_price: GasPrice,
    pub gas_limit: u64,
    pub tx_hash: H256,
    pub signed_raw: Bytes,
    pub state: AttemptState,
    /// Head number at submission, or the first head observed after it
    pub broadcast_block: Option<u64>,
    pub submitted_at: DateTime<Utc>,
}

impl Attempt {
    pub fn from_new(tx_id: Uuid, new: NewAttempt) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx_id,
            nonce: new.nonce,
            gas_price: new.gas_price,
            gas_limit: new.gas_limit,
            tx_hash: new.tx_hash,
            signed_raw: new.signed_raw,
            state: AttemptState::Active,
            broadcast_block: new.broadcast_block,
            submitted_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == AttemptState::Active
    }
}

/// An in-flight transaction with its attempt history, oldest attempt first
#[derive(Debug, Clone)]
pub struct InFlight {
    pub tx: Transaction,
    pub attempts: Vec<Attempt>,
}

impl InFlight {
    pub fn active_attempt(&self) -> Option<&Attempt> {
        self.attempts.iter().find(|a| a.is_active())
    }

    /// Number of fee escalations performed so far
    pub fn escalations(&self) -> u32 {
        self.attempts.len().saturating_sub(1) as u32
    }
}

/// Per (chain, address) next-nonce-to-assign counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCursor {
    pub chain_id: u64,
    pub address: Address,
    pub next_nonce: u64,
}

/// Transaction counts per state
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionStats {
    pub unstarted: u64,
    pub broadcast: u64,
    pub confirmed: u64,
    pub finalized: u64,
    pub fatal: u64,
}

impl TransactionStats {
    pub fn record(&mut self, state: TxState, count: u64) {
        match state {
            TxState::Unstarted => self.unstarted += count,
            TxState::Broadcast => self.broadcast += count,
            TxState::Confirmed => self.confirmed += count,
            TxState::Finalized => self.finalized += count,
            TxState::Fatal => self.fatal += count,
        }
    }
}
