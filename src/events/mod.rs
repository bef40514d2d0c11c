//! Transaction lifecycle events
//!
//! Every state transition the pipeline performs is published on a per-chain
//! broadcast bus; subscribers that lag simply miss events.

use crate::tx::GasPrice;

use ethers::types::H256;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Observable lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TxEvent {
    /// First attempt accepted by the chain
    Broadcast {
        chain_id: u64,
        tx_id: Uuid,
        nonce: u64,
        tx_hash: H256,
    },

    /// Attempt included in a block
    Confirmed {
        chain_id: u64,
        tx_id: Uuid,
        tx_hash: H256,
        block_number: u64,
        success: bool,
    },

    Finalized {
        chain_id: u64,
        tx_id: Uuid,
        block_number: u64,
    },

    Fatal {
        chain_id: u64,
        tx_id: Uuid,
        reason: String,
    },

    /// Replacement attempt with the same nonce at a higher fee
    FeeBumped {
        chain_id: u64,
        tx_id: Uuid,
        nonce: u64,
        tx_hash: H256,
        gas_price: GasPrice,
    },

    /// Confirmation discarded because its block left the canonical chain
    ReorgDetected {
        chain_id: u64,
        tx_id: Uuid,
        block_number: u64,
    },

    Reaped {
        chain_id: u64,
        count: u64,
    },
}

impl TxEvent {
    pub fn chain_id(&self) -> u64 {
        match self {
            TxEvent::Broadcast { chain_id, .. }
            | TxEvent::Confirmed { chain_id, .. }
            | TxEvent::Finalized { chain_id, .. }
            | TxEvent::Fatal { chain_id, .. }
            | TxEvent::FeeBumped { chain_id, .. }
            | TxEvent::ReorgDetected { chain_id, .. }
            | TxEvent::Reaped { chain_id, .. } => *chain_id,
        }
    }

    /// Transaction the event refers to, if any
    pub fn tx_id(&self) -> Option<Uuid> {
        match self {
            TxEvent::Broadcast { tx_id, .. }
            | TxEvent::Confirmed { tx_id, .. }
            | TxEvent::Finalized { tx_id, .. }
            | TxEvent::Fatal { tx_id, .. }
            | TxEvent::FeeBumped { tx_id, .. }
            | TxEvent::ReorgDetected { tx_id, .. } => Some(*tx_id),
            TxEvent::Reaped { .. } => None,
        }
    }

    /// Get event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TxEvent::Broadcast { .. } => "broadcast",
            TxEvent::Confirmed { .. } => "confirmed",
            TxEvent::Finalized { .. } => "finalized",
            TxEvent::Fatal { .. } => "fatal",
            TxEvent::FeeBumped { .. } => "fee_bumped",
            TxEvent::ReorgDetected { .. } => "reorg_detected",
            TxEvent::Reaped { .. } => "reaped",
        }
    }
}

/// Per-chain event bus
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.sender.subscribe()
    }

    /// Record and broadcast an event
    pub fn publish(&self, event: TxEvent) {
        crate::metrics::record_event(&event);
        debug!(
            chain_id = event.chain_id(),
            tx_id = ?event.tx_id(),
            "event {}",
            event.name()
        );

        // No receivers is fine
        let _ = self.sender.send(event);
    }
}
