//! Scripted in-process chain and store doubles for pipeline tests

use crate::chain::{ChainClient, ChainError, Head, ReceiptInfo};
use crate::config::{ChainPolicy, FeeConfig};
use crate::error::{TxmError, TxmResult};
use crate::events::EventBus;
use crate::state::{
    Attempt, InFlight, MemoryTxStore, NewAttempt, NewTransaction, NonceCursor, Receipt,
    Transaction, TransactionStats, TxRequest, TxState, TxStore,
};
use crate::tx::{LocalKeySigner, NonceManager};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Well-known development key (anvil account 0)
pub const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn dev_address() -> Address {
    "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap()
}

pub fn dev_signer() -> LocalKeySigner {
    LocalKeySigner::from_keys(&[DEV_KEY]).unwrap()
}

pub fn chain_policy() -> ChainPolicy {
    ChainPolicy {
        chain_id: 1,
        finality_depth: 5,
        finality_tag_enabled: false,
        nonce_auto_sync: true,
        rpc_batch_size: 10,
        broadcast_interval: Duration::from_millis(20),
    }
}

/// Shared collaborators of one chain pipeline, wired to a fake chain
pub struct Pipeline {
    pub store: Arc<MemoryTxStore>,
    pub chain: Arc<FakeChain>,
    pub signer: Arc<LocalKeySigner>,
    pub nonces: Arc<NonceManager>,
    pub events: EventBus,
    pub fees: FeeConfig,
    pub policy: ChainPolicy,
}

impl Pipeline {
    pub fn new() -> Self {
        let store = Arc::new(MemoryTxStore::new());
        let chain = Arc::new(FakeChain::new(1));
        let nonces = Arc::new(NonceManager::new(1, true, store.clone(), chain.clone()));
        Self {
            store,
            chain,
            signer: Arc::new(dev_signer()),
            nonces,
            events: EventBus::new(64),
            fees: crate::config::tests::fee_config(),
            policy: chain_policy(),
        }
    }

    /// Insert an unstarted transaction from the development sender
    pub async fn enqueue(&self) -> Transaction {
        self.store
            .insert_transaction(NewTransaction {
                chain_id: 1,
                request: TxRequest {
                    from: dev_address(),
                    to: Address::repeat_byte(0x22),
                    value: U256::from(1u64),
                    data: Bytes::default(),
                    gas_limit: None,
                },
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, tx: &Transaction) -> Transaction {
        self.store.get_transaction(tx.id).await.unwrap().unwrap()
    }
}

#[derive(Default)]
struct FakeState {
    /// Canonical block hashes, indexed by number
    blocks: Vec<H256>,
    /// Included transaction hash -> (block number, success)
    included: HashMap<H256, (u64, bool)>,
    nonces: HashMap<Address, u64>,
    send_script: VecDeque<Result<(), ChainError>>,
    sent: Vec<Bytes>,
    finalized: u64,
}

/// A chain whose blocks, inclusions and send outcomes are driven by the test
pub struct FakeChain {
    chain_id: u64,
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(FakeState {
                blocks: vec![H256::random()],
                ..Default::default()
            }),
        }
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(address, nonce);
    }

    /// Append `count` blocks and return the new head number
    pub fn mine(&self, count: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.blocks.push(H256::random());
        }
        state.blocks.len() as u64 - 1
    }

    /// Mine blocks until the head is at `number`
    pub fn mine_to(&self, number: u64) {
        let head = self.head_number();
        if number > head {
            self.mine(number - head);
        }
    }

    pub fn head_number(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    pub fn block_hash_at(&self, number: u64) -> Option<H256> {
        self.state.lock().unwrap().blocks.get(number as usize).copied()
    }

    pub fn include(&self, hash: H256, block: u64) {
        self.state.lock().unwrap().included.insert(hash, (block, true));
    }

    pub fn include_reverted(&self, hash: H256, block: u64) {
        self.state.lock().unwrap().included.insert(hash, (block, false));
    }

    /// Replace every block from `from` upward with a competing block and drop
    /// the inclusions they carried
    pub fn reorg(&self, from: u64) {
        let mut state = self.state.lock().unwrap();
        for number in from as usize..state.blocks.len() {
            state.blocks[number] = H256::random();
        }
        state.included.retain(|_, (block, _)| *block < from);
    }

    /// Queue outcomes for the next sends; an empty script accepts
    pub fn script_send(&self, outcomes: impl IntoIterator<Item = Result<(), ChainError>>) {
        self.state.lock().unwrap().send_script.extend(outcomes);
    }

    pub fn set_finalized(&self, number: u64) {
        self.state.lock().unwrap().finalized = number;
    }

    /// Every payload accepted so far, in submission order
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_hashes(&self) -> Vec<H256> {
        self.sent()
            .iter()
            .map(|raw| H256::from(keccak256(raw)))
            .collect()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        match state.send_script.pop_front() {
            Some(Err(e)) => Err(e),
            _ => {
                state.sent.push(raw);
                Ok(())
            }
        }
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state.included.get(&hash).and_then(|(block, success)| {
            state.blocks.get(*block as usize).map(|block_hash| ReceiptInfo {
                tx_hash: hash,
                block_number: *block,
                block_hash: *block_hash,
                success: *success,
            })
        }))
    }

    async fn head(&self) -> Result<Head, ChainError> {
        let state = self.state.lock().unwrap();
        let number = state.blocks.len() as u64 - 1;
        Ok(Head {
            number,
            hash: state.blocks[number as usize],
        })
    }

    async fn block_hash(&self, number: u64) -> Result<Option<H256>, ChainError> {
        Ok(self.block_hash_at(number))
    }

    async fn finalized_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().finalized)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or(0))
    }
}

/// Memory store whose broadcast writes can be made to fail
pub struct FlakyStore {
    inner: Arc<MemoryTxStore>,
    broadcast_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryTxStore>) -> Self {
        Self {
            inner,
            broadcast_failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` broadcast writes
    pub fn fail_broadcasts(&self, count: u32) {
        self.broadcast_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxStore for FlakyStore {
    async fn insert_transaction(&self, new: NewTransaction) -> TxmResult<Transaction> {
        self.inner.insert_transaction(new).await
    }

    async fn get_transaction(&self, tx_id: Uuid) -> TxmResult<Option<Transaction>> {
        self.inner.get_transaction(tx_id).await
    }

    async fn attempts(&self, tx_id: Uuid) -> TxmResult<Vec<Attempt>> {
        self.inner.attempts(tx_id).await
    }

    async fn list_transactions(
        &self,
        chain_id: u64,
        state: Option<TxState>,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>> {
        self.inner.list_transactions(chain_id, state, limit).await
    }

    async fn unstarted_senders(&self, chain_id: u64) -> TxmResult<Vec<Address>> {
        self.inner.unstarted_senders(chain_id).await
    }

    async fn oldest_unstarted(
        &self,
        chain_id: u64,
        from: Address,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>> {
        self.inner.oldest_unstarted(chain_id, from, limit).await
    }

    async fn max_assigned_nonce(&self, chain_id: u64, from: Address) -> TxmResult<Option<u64>> {
        self.inner.max_assigned_nonce(chain_id, from).await
    }

    async fn load_nonce_cursor(
        &self,
        chain_id: u64,
        address: Address,
    ) -> TxmResult<Option<NonceCursor>> {
        self.inner.load_nonce_cursor(chain_id, address).await
    }

    async fn save_nonce_cursor(&self, cursor: NonceCursor) -> TxmResult<()> {
        self.inner.save_nonce_cursor(cursor).await
    }

    async fn mark_broadcast(&self, tx_id: Uuid, attempt: NewAttempt) -> TxmResult<Option<Attempt>> {
        let failing = self
            .broadcast_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TxmError::Internal("connection to store lost".into()));
        }
        self.inner.mark_broadcast(tx_id, attempt).await
    }

    async fn replace_attempt(
        &self,
        tx_id: Uuid,
        superseded: Uuid,
        attempt: NewAttempt,
    ) -> TxmResult<Option<Attempt>> {
        self.inner.replace_attempt(tx_id, superseded, attempt).await
    }

    async fn set_broadcast_block(&self, attempt_id: Uuid, block_number: u64) -> TxmResult<()> {
        self.inner.set_broadcast_block(attempt_id, block_number).await
    }

    async fn mark_confirmed(&self, tx_id: Uuid, receipt: Receipt) -> TxmResult<bool> {
        self.inner.mark_confirmed(tx_id, receipt).await
    }

    async fn mark_finalized(&self, tx_id: Uuid) -> TxmResult<bool> {
        self.inner.mark_finalized(tx_id).await
    }

    async fn revert_to_broadcast(&self, tx_id: Uuid) -> TxmResult<bool> {
        self.inner.revert_to_broadcast(tx_id).await
    }

    async fn mark_fatal(&self, tx_id: Uuid, reason: &str) -> TxmResult<bool> {
        self.inner.mark_fatal(tx_id, reason).await
    }

    async fn in_flight(&self, chain_id: u64) -> TxmResult<Vec<InFlight>> {
        self.inner.in_flight(chain_id).await
    }

    async fn reap(
        &self,
        chain_id: u64,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> TxmResult<u64> {
        self.inner.reap(chain_id, older_than, limit).await
    }

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats> {
        self.inner.stats(chain_id).await
    }

    async fn health_check(&self) -> TxmResult<()> {
        self.inner.health_check().await
    }
}
