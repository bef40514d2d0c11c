//! In-memory transaction store for tests and development runs

use super::types::*;
use super::TxStore;
use crate::error::TxmResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    transactions: HashMap<Uuid, Transaction>,
    attempts: HashMap<Uuid, Vec<Attempt>>,
    cursors: HashMap<(u64, Address), u64>,
    /// Creation time of the newest transaction; keeps insertion order total
    last_created: Option<DateTime<Utc>>,
}

impl Inner {
    fn in_state(&mut self, tx_id: Uuid, expected: TxState) -> Option<&mut Transaction> {
        self.transactions
            .get_mut(&tx_id)
            .filter(|tx| tx.state == expected)
    }

    fn close_attempts(&mut self, tx_id: Uuid) {
        if let Some(attempts) = self.attempts.get_mut(&tx_id) {
            for attempt in attempts.iter_mut().filter(|a| a.is_active()) {
                attempt.state = AttemptState::Closed;
            }
        }
    }
}

/// Store backed by a single lock; every transition is one write section
#[derive(Default)]
pub struct MemoryTxStore {
    inner: RwLock<Inner>,
}

impl MemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ordered(mut txs: Vec<Transaction>) -> Vec<Transaction> {
    txs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    txs
}

#[async_trait]
impl TxStore for MemoryTxStore {
    async fn insert_transaction(&self, new: NewTransaction) -> TxmResult<Transaction> {
        let mut inner = self.inner.write().await;
        let now = match inner.last_created {
            Some(last) if last >= Utc::now() => last + chrono::Duration::microseconds(1),
            _ => Utc::now(),
        };
        inner.last_created = Some(now);

        let tx = Transaction {
            id: Uuid::new_v4(),
            chain_id: new.chain_id,
            from: new.request.from,
            to: new.request.to,
            value: new.request.value,
            data: new.request.data,
            gas_limit: new.request.gas_limit,
            state: TxState::Unstarted,
            nonce: None,
            receipt: None,
            fatal_reason: None,
            created_at: now,
            updated_at: now,
        };

        inner.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn get_transaction(&self, tx_id: Uuid) -> TxmResult<Option<Transaction>> {
        Ok(self.inner.read().await.transactions.get(&tx_id).cloned())
    }

    async fn attempts(&self, tx_id: Uuid) -> TxmResult<Vec<Attempt>> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .get(&tx_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_transactions(
        &self,
        chain_id: u64,
        state: Option<TxState>,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let txs = inner
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && state.map_or(true, |s| tx.state == s))
            .cloned()
            .collect();
        Ok(ordered(txs).into_iter().take(limit).collect())
    }

    async fn unstarted_senders(&self, chain_id: u64) -> TxmResult<Vec<Address>> {
        let inner = self.inner.read().await;
        let senders: BTreeSet<Address> = inner
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.state == TxState::Unstarted)
            .map(|tx| tx.from)
            .collect();
        Ok(senders.into_iter().collect())
    }

    async fn oldest_unstarted(
        &self,
        chain_id: u64,
        from: Address,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let txs = inner
            .transactions
            .values()
            .filter(|tx| {
                tx.chain_id == chain_id && tx.from == from && tx.state == TxState::Unstarted
            })
            .cloned()
            .collect();
        Ok(ordered(txs).into_iter().take(limit).collect())
    }

    async fn max_assigned_nonce(&self, chain_id: u64, from: Address) -> TxmResult<Option<u64>> {
        let inner = self.inner.read().await;
        Ok(inner
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.from == from && tx.state != TxState::Fatal)
            .filter_map(|tx| tx.nonce)
            .max())
    }

    async fn load_nonce_cursor(
        &self,
        chain_id: u64,
        address: Address,
    ) -> TxmResult<Option<NonceCursor>> {
        let inner = self.inner.read().await;
        Ok(inner
            .cursors
            .get(&(chain_id, address))
            .map(|next_nonce| NonceCursor {
                chain_id,
                address,
                next_nonce: *next_nonce,
            }))
    }

    async fn save_nonce_cursor(&self, cursor: NonceCursor) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .cursors
            .insert((cursor.chain_id, cursor.address), cursor.next_nonce);
        Ok(())
    }

    async fn mark_broadcast(&self, tx_id: Uuid, attempt: NewAttempt) -> TxmResult<Option<Attempt>> {
        let mut inner = self.inner.write().await;
        let Some(tx) = inner.in_state(tx_id, TxState::Unstarted) else {
            return Ok(None);
        };
        tx.state = TxState::Broadcast;
        tx.nonce = Some(attempt.nonce);
        tx.updated_at = Utc::now();

        let attempt = Attempt::from_new(tx_id, attempt);
        inner.attempts.entry(tx_id).or_default().push(attempt.clone());
        Ok(Some(attempt))
    }

    async fn replace_attempt(
        &self,
        tx_id: Uuid,
        superseded: Uuid,
        attempt: NewAttempt,
    ) -> TxmResult<Option<Attempt>> {
        let mut inner = self.inner.write().await;
        let active_matches = inner
            .attempts
            .get(&tx_id)
            .map(|attempts| attempts.iter().any(|a| a.id == superseded && a.is_active()))
            .unwrap_or(false);
        if !active_matches {
            return Ok(None);
        }
        let Some(tx) = inner.in_state(tx_id, TxState::Broadcast) else {
            return Ok(None);
        };
        tx.updated_at = Utc::now();

        let attempt = Attempt::from_new(tx_id, attempt);
        let attempts = inner.attempts.entry(tx_id).or_default();
        for previous in attempts.iter_mut() {
            previous.state = AttemptState::Superseded;
        }
        attempts.push(attempt.clone());
        Ok(Some(attempt))
    }

    async fn set_broadcast_block(&self, attempt_id: Uuid, block_number: u64) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        for attempts in inner.attempts.values_mut() {
            if let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id) {
                attempt.broadcast_block.get_or_insert(block_number);
                break;
            }
        }
        Ok(())
    }

    async fn mark_confirmed(&self, tx_id: Uuid, receipt: Receipt) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.in_state(tx_id, TxState::Broadcast) {
            Some(tx) => {
                tx.state = TxState::Confirmed;
                tx.receipt = Some(receipt);
                tx.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn mark_finalized(&self, tx_id: Uuid) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(tx) = inner.in_state(tx_id, TxState::Confirmed) else {
            return Ok(false);
        };
        tx.state = TxState::Finalized;
        tx.updated_at = Utc::now();
        inner.close_attempts(tx_id);
        Ok(true)
    }

    async fn revert_to_broadcast(&self, tx_id: Uuid) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.in_state(tx_id, TxState::Confirmed) {
            Some(tx) => {
                tx.state = TxState::Broadcast;
                tx.receipt = None;
                tx.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn mark_fatal(&self, tx_id: Uuid, reason: &str) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.transactions.get_mut(&tx_id) {
            Some(tx) if !tx.state.is_terminal() => {
                tx.state = TxState::Fatal;
                tx.fatal_reason = Some(reason.to_string());
                tx.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        inner.close_attempts(tx_id);
        Ok(true)
    }

    async fn in_flight(&self, chain_id: u64) -> TxmResult<Vec<InFlight>> {
        let inner = self.inner.read().await;
        let txs = inner
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.state.has_active_attempt())
            .cloned()
            .collect();
        Ok(ordered(txs)
            .into_iter()
            .map(|tx| InFlight {
                attempts: inner.attempts.get(&tx.id).cloned().unwrap_or_default(),
                tx,
            })
            .collect())
    }

    async fn reap(
        &self,
        chain_id: u64,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> TxmResult<u64> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .transactions
            .values()
            .filter(|tx| {
                tx.chain_id == chain_id && tx.state.is_terminal() && tx.updated_at < older_than
            })
            .map(|tx| tx.id)
            .take(limit)
            .collect();

        for tx_id in &expired {
            inner.transactions.remove(tx_id);
            inner.attempts.remove(tx_id);
        }
        Ok(expired.len() as u64)
    }

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats> {
        let inner = self.inner.read().await;
        let mut stats = TransactionStats::default();
        for tx in inner.transactions.values().filter(|tx| tx.chain_id == chain_id) {
            stats.record(tx.state, 1);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> TxmResult<()> {
        Ok(())
    }
}
