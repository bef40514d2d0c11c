//! PostgreSQL transaction store

use super::types::*;
use super::TxStore;
use crate::config::DatabaseConfig;
use crate::error::{TxmError, TxmResult};
use crate::tx::GasPrice;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const TX_COLUMNS: &str = "id, chain_id, from_address, to_address, value, data, gas_limit, state, \
                          nonce, receipt, fatal_reason, created_at, updated_at";

const ATTEMPT_COLUMNS: &str =
    "id, tx_id, nonce, gas_price, gas_limit, tx_hash, signed_raw, state, broadcast_block, submitted_at";

/// Transaction store for PostgreSQL persistence
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> TxmResult<Self> {
        let mut options = PgConnectOptions::from_str(&config.url)?;
        if !config.log_sql {
            options = options.disable_statement_logging();
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.default_query_timeout())
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TxmResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txm_transactions (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                from_address BYTEA NOT NULL,
                to_address BYTEA NOT NULL,
                value TEXT NOT NULL,
                data BYTEA NOT NULL,
                gas_limit BIGINT,
                state VARCHAR(20) NOT NULL,
                nonce BIGINT,
                receipt JSONB,
                fatal_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_txm_transactions_chain_state
            ON txm_transactions (chain_id, state, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txm_attempts (
                id UUID PRIMARY KEY,
                tx_id UUID NOT NULL REFERENCES txm_transactions (id) ON DELETE CASCADE,
                nonce BIGINT NOT NULL,
                gas_price JSONB NOT NULL,
                gas_limit BIGINT NOT NULL,
                tx_hash BYTEA NOT NULL,
                signed_raw BYTEA NOT NULL,
                state VARCHAR(20) NOT NULL,
                broadcast_block BIGINT,
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txm_attempts_one_active
            ON txm_attempts (tx_id) WHERE state = 'active'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txm_nonce_cursors (
                chain_id BIGINT NOT NULL,
                address BYTEA NOT NULL,
                next_nonce BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn decode_err(what: &str, e: impl std::fmt::Display) -> TxmError {
    TxmError::Internal(format!("Failed to decode {}: {}", what, e))
}

fn row_to_transaction(row: &PgRow) -> TxmResult<Transaction> {
    let from: Vec<u8> = row.try_get("from_address")?;
    let to: Vec<u8> = row.try_get("to_address")?;
    let value: String = row.try_get("value")?;
    let data: Vec<u8> = row.try_get("data")?;
    let state: String = row.try_get("state")?;
    let receipt: Option<serde_json::Value> = row.try_get("receipt")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        from: Address::from_slice(&from),
        to: Address::from_slice(&to),
        value: U256::from_dec_str(&value).map_err(|e| decode_err("value", e))?,
        data: Bytes::from(data),
        gas_limit: row.try_get::<Option<i64>, _>("gas_limit")?.map(|g| g as u64),
        state: TxState::from_str(&state).map_err(|e| decode_err("state", e))?,
        nonce: row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64),
        receipt: receipt
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_err("receipt", e))?,
        fatal_reason: row.try_get("fatal_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_attempt(row: &PgRow) -> TxmResult<Attempt> {
    let gas_price: serde_json::Value = row.try_get("gas_price")?;
    let tx_hash: Vec<u8> = row.try_get("tx_hash")?;
    let signed_raw: Vec<u8> = row.try_get("signed_raw")?;
    let state: String = row.try_get("state")?;

    Ok(Attempt {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        gas_price: serde_json::from_value::<GasPrice>(gas_price)
            .map_err(|e| decode_err("gas price", e))?,
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        tx_hash: H256::from_slice(&tx_hash),
        signed_raw: Bytes::from(signed_raw),
        state: AttemptState::from_str(&state).map_err(|e| decode_err("attempt state", e))?,
        broadcast_block: row.try_get::<Option<i64>, _>("broadcast_block")?.map(|b| b as u64),
        submitted_at: row.try_get("submitted_at")?,
    })
}

async fn insert_attempt(
    conn: &mut sqlx::PgConnection,
    attempt: &Attempt,
) -> TxmResult<()> {
    let gas_price =
        serde_json::to_value(&attempt.gas_price).map_err(|e| TxmError::Internal(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO txm_attempts
            (id, tx_id, nonce, gas_price, gas_limit, tx_hash, signed_raw, state,
             broadcast_block, submitted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(attempt.id)
    .bind(attempt.tx_id)
    .bind(attempt.nonce as i64)
    .bind(gas_price)
    .bind(attempt.gas_limit as i64)
    .bind(attempt.tx_hash.as_bytes())
    .bind(attempt.signed_raw.as_ref())
    .bind(attempt.state.as_str())
    .bind(attempt.broadcast_block.map(|b| b as i64))
    .bind(attempt.submitted_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Retire the active attempt of a transaction that reached a terminal state
async fn close_attempts(conn: &mut sqlx::PgConnection, tx_id: Uuid) -> TxmResult<()> {
    sqlx::query("UPDATE txm_attempts SET state = 'closed' WHERE tx_id = $1 AND state = 'active'")
        .bind(tx_id)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn insert_transaction(&self, new: NewTransaction) -> TxmResult<Transaction> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO txm_transactions
                (id, chain_id, from_address, to_address, value, data, gas_limit, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'unstarted')
            RETURNING {}
            "#,
            TX_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.chain_id as i64)
        .bind(new.request.from.as_bytes())
        .bind(new.request.to.as_bytes())
        .bind(new.request.value.to_string())
        .bind(new.request.data.as_ref())
        .bind(new.request.gas_limit.map(|g| g as i64))
        .fetch_one(&self.pool)
        .await?;

        row_to_transaction(&row)
    }

    async fn get_transaction(&self, tx_id: Uuid) -> TxmResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM txm_transactions WHERE id = $1",
            TX_COLUMNS
        ))
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn attempts(&self, tx_id: Uuid) -> TxmResult<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM txm_attempts WHERE tx_id = $1 ORDER BY submitted_at, id",
            ATTEMPT_COLUMNS
        ))
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    async fn list_transactions(
        &self,
        chain_id: u64,
        state: Option<TxState>,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM txm_transactions
            WHERE chain_id = $1 AND ($2::VARCHAR IS NULL OR state = $2)
            ORDER BY created_at, id
            LIMIT $3
            "#,
            TX_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(state.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn unstarted_senders(&self, chain_id: u64) -> TxmResult<Vec<Address>> {
        let rows = sqlx::query(
            "SELECT DISTINCT from_address FROM txm_transactions WHERE chain_id = $1 AND state = 'unstarted'",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let bytes: Vec<u8> = row.try_get("from_address")?;
                Ok(Address::from_slice(&bytes))
            })
            .collect()
    }

    async fn oldest_unstarted(
        &self,
        chain_id: u64,
        from: Address,
        limit: usize,
    ) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM txm_transactions
            WHERE chain_id = $1 AND from_address = $2 AND state = 'unstarted'
            ORDER BY created_at, id
            LIMIT $3
            "#,
            TX_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(from.as_bytes())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn max_assigned_nonce(&self, chain_id: u64, from: Address) -> TxmResult<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(nonce) AS max_nonce FROM txm_transactions
            WHERE chain_id = $1 AND from_address = $2 AND state <> 'fatal' AND nonce IS NOT NULL
            "#,
        )
        .bind(chain_id as i64)
        .bind(from.as_bytes())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<Option<i64>, _>("max_nonce")?.map(|n| n as u64))
    }

    async fn load_nonce_cursor(
        &self,
        chain_id: u64,
        address: Address,
    ) -> TxmResult<Option<NonceCursor>> {
        let row = sqlx::query(
            "SELECT next_nonce FROM txm_nonce_cursors WHERE chain_id = $1 AND address = $2",
        )
        .bind(chain_id as i64)
        .bind(address.as_bytes())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| NonceCursor {
            chain_id,
            address,
            next_nonce: r.get::<i64, _>("next_nonce") as u64,
        }))
    }

    async fn save_nonce_cursor(&self, cursor: NonceCursor) -> TxmResult<()> {
        sqlx::query(
            r#"
            INSERT INTO txm_nonce_cursors (chain_id, address, next_nonce, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (chain_id, address)
            DO UPDATE SET next_nonce = $3, updated_at = NOW()
            "#,
        )
        .bind(cursor.chain_id as i64)
        .bind(cursor.address.as_bytes())
        .bind(cursor.next_nonce as i64)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved nonce cursor for chain {} {:?}: {}",
            cursor.chain_id, cursor.address, cursor.next_nonce
        );
        Ok(())
    }

    async fn mark_broadcast(&self, tx_id: Uuid, attempt: NewAttempt) -> TxmResult<Option<Attempt>> {
        let attempt = Attempt::from_new(tx_id, attempt);
        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE txm_transactions SET state = 'broadcast', nonce = $1, updated_at = NOW()
            WHERE id = $2 AND state = 'unstarted'
            "#,
        )
        .bind(attempt.nonce as i64)
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        if updated.rows_affected() != 1 {
            dbtx.rollback().await?;
            return Ok(None);
        }

        insert_attempt(&mut dbtx, &attempt).await?;
        dbtx.commit().await?;
        Ok(Some(attempt))
    }

    async fn replace_attempt(
        &self,
        tx_id: Uuid,
        superseded: Uuid,
        attempt: NewAttempt,
    ) -> TxmResult<Option<Attempt>> {
        let attempt = Attempt::from_new(tx_id, attempt);
        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE txm_attempts SET state = 'superseded'
            WHERE id = $1 AND tx_id = $2 AND state = 'active'
              AND EXISTS (SELECT 1 FROM txm_transactions WHERE id = $2 AND state = 'broadcast')
            "#,
        )
        .bind(superseded)
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        if updated.rows_affected() != 1 {
            dbtx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("UPDATE txm_transactions SET updated_at = NOW() WHERE id = $1")
            .bind(tx_id)
            .execute(&mut *dbtx)
            .await?;
        insert_attempt(&mut dbtx, &attempt).await?;
        dbtx.commit().await?;
        Ok(Some(attempt))
    }

    async fn set_broadcast_block(&self, attempt_id: Uuid, block_number: u64) -> TxmResult<()> {
        sqlx::query(
            "UPDATE txm_attempts SET broadcast_block = $1 WHERE id = $2 AND broadcast_block IS NULL",
        )
        .bind(block_number as i64)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_confirmed(&self, tx_id: Uuid, receipt: Receipt) -> TxmResult<bool> {
        let receipt =
            serde_json::to_value(&receipt).map_err(|e| TxmError::Internal(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE txm_transactions SET state = 'confirmed', receipt = $1, updated_at = NOW()
            WHERE id = $2 AND state = 'broadcast'
            "#,
        )
        .bind(receipt)
        .bind(tx_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_finalized(&self, tx_id: Uuid) -> TxmResult<bool> {
        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE txm_transactions SET state = 'finalized', updated_at = NOW()
            WHERE id = $1 AND state = 'confirmed'
            "#,
        )
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        if updated.rows_affected() != 1 {
            dbtx.rollback().await?;
            return Ok(false);
        }

        close_attempts(&mut dbtx, tx_id).await?;
        dbtx.commit().await?;
        Ok(true)
    }

    async fn revert_to_broadcast(&self, tx_id: Uuid) -> TxmResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE txm_transactions SET state = 'broadcast', receipt = NULL, updated_at = NOW()
            WHERE id = $1 AND state = 'confirmed'
            "#,
        )
        .bind(tx_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_fatal(&self, tx_id: Uuid, reason: &str) -> TxmResult<bool> {
        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE txm_transactions SET state = 'fatal', fatal_reason = $1, updated_at = NOW()
            WHERE id = $2 AND state NOT IN ('finalized', 'fatal')
            "#,
        )
        .bind(reason)
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        if updated.rows_affected() != 1 {
            dbtx.rollback().await?;
            return Ok(false);
        }

        close_attempts(&mut dbtx, tx_id).await?;
        dbtx.commit().await?;
        Ok(true)
    }

    async fn in_flight(&self, chain_id: u64) -> TxmResult<Vec<InFlight>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM txm_transactions
            WHERE chain_id = $1 AND state IN ('broadcast', 'confirmed')
            ORDER BY created_at, id
            "#,
            TX_COLUMNS
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let txs = rows
            .iter()
            .map(row_to_transaction)
            .collect::<TxmResult<Vec<_>>>()?;
        if txs.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = txs.iter().map(|tx| tx.id).collect();
        let attempt_rows = sqlx::query(&format!(
            "SELECT {} FROM txm_attempts WHERE tx_id = ANY($1) ORDER BY submitted_at, id",
            ATTEMPT_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut attempts = attempt_rows
            .iter()
            .map(row_to_attempt)
            .collect::<TxmResult<Vec<_>>>()?;

        Ok(txs
            .into_iter()
            .map(|tx| {
                let (mine, rest): (Vec<_>, Vec<_>) =
                    attempts.drain(..).partition(|a| a.tx_id == tx.id);
                attempts = rest;
                InFlight { tx, attempts: mine }
            })
            .collect())
    }

    async fn reap(
        &self,
        chain_id: u64,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> TxmResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM txm_transactions WHERE id IN (
                SELECT id FROM txm_transactions
                WHERE chain_id = $1 AND state IN ('finalized', 'fatal') AND updated_at < $2
                LIMIT $3
            )
            "#,
        )
        .bind(chain_id as i64)
        .bind(older_than)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM txm_transactions WHERE chain_id = $1 GROUP BY state",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TransactionStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            if let Ok(state) = TxState::from_str(&state) {
                stats.record(state, count as u64);
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> TxmResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;

    /// Store against `TXM_TEST_DATABASE_URL`; every test returns early when it is unset
    async fn store() -> Option<PgTxStore> {
        let url = std::env::var("TXM_TEST_DATABASE_URL").ok()?;
        let store = PgTxStore::new(&DatabaseConfig {
            backend: StorageBackend::Postgres,
            url,
            max_connections: 2,
            min_connections: 0,
            default_query_timeout_ms: 5_000,
            log_sql: false,
        })
        .await
        .unwrap();

        // concurrent tests may race on the first CREATE TABLE
        if store.run_migrations().await.is_err() {
            store.run_migrations().await.unwrap();
        }
        Some(store)
    }

    /// Chain id no other test run shares
    fn isolated_chain() -> u64 {
        (Uuid::new_v4().as_u128() as u64) & 0x7fff_ffff_ffff
    }

    fn request(chain_id: u64, from: Address) -> NewTransaction {
        NewTransaction {
            chain_id,
            request: TxRequest {
                from,
                to: Address::repeat_byte(0xee),
                value: U256::from(1_000u64),
                data: Bytes::from(vec![0xde, 0xad]),
                gas_limit: Some(50_000),
            },
        }
    }

    fn attempt(nonce: u64, price: u64) -> NewAttempt {
        NewAttempt {
            nonce,
            gas_price: GasPrice::Legacy(U256::from(price)),
            gas_limit: 21_000,
            tx_hash: H256::random(),
            signed_raw: Bytes::from(vec![price as u8]),
            broadcast_block: Some(100),
        }
    }

    fn receipt(block_number: u64) -> Receipt {
        Receipt {
            tx_hash: H256::random(),
            block_number,
            block_hash: H256::random(),
            success: true,
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let Some(store) = store().await else { return };
        let chain_id = isolated_chain();
        let sender = Address::random();

        let tx = store.insert_transaction(request(chain_id, sender)).await.unwrap();
        let loaded = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TxState::Unstarted);
        assert_eq!(loaded.from, sender);
        assert_eq!(loaded.value, U256::from(1_000u64));
        assert_eq!(loaded.data, Bytes::from(vec![0xde, 0xad]));
        assert_eq!(loaded.gas_limit, Some(50_000));

        assert_eq!(store.unstarted_senders(chain_id).await.unwrap(), vec![sender]);
        assert_eq!(store.stats(chain_id).await.unwrap().unstarted, 1);
    }

    #[tokio::test]
    async fn test_transitions_are_conditional() {
        let Some(store) = store().await else { return };
        let chain_id = isolated_chain();
        let tx = store
            .insert_transaction(request(chain_id, Address::random()))
            .await
            .unwrap();

        assert!(!store.mark_finalized(tx.id).await.unwrap());
        let first = store.mark_broadcast(tx.id, attempt(0, 10)).await.unwrap().unwrap();
        assert_eq!(first.broadcast_block, Some(100));
        assert!(store.mark_broadcast(tx.id, attempt(1, 10)).await.unwrap().is_none());

        assert!(store.mark_confirmed(tx.id, receipt(5)).await.unwrap());
        assert!(!store.mark_confirmed(tx.id, receipt(5)).await.unwrap());
        assert!(store.revert_to_broadcast(tx.id).await.unwrap());

        let reverted = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(reverted.state, TxState::Broadcast);
        assert_eq!(reverted.nonce, Some(0));
        assert!(reverted.receipt.is_none());

        assert!(store.mark_fatal(tx.id, "fee ceiling reached").await.unwrap());
        assert!(!store.mark_fatal(tx.id, "again").await.unwrap());
        let failed = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(failed.fatal_reason.as_deref(), Some("fee ceiling reached"));
    }

    #[tokio::test]
    async fn test_replace_keeps_single_active_attempt() {
        let Some(store) = store().await else { return };
        let chain_id = isolated_chain();
        let tx = store
            .insert_transaction(request(chain_id, Address::random()))
            .await
            .unwrap();
        let first = store.mark_broadcast(tx.id, attempt(7, 10)).await.unwrap().unwrap();
        let second = store
            .replace_attempt(tx.id, first.id, attempt(7, 12))
            .await
            .unwrap()
            .unwrap();

        assert!(store
            .replace_attempt(tx.id, first.id, attempt(7, 15))
            .await
            .unwrap()
            .is_none());

        let attempts = store.attempts(tx.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts.iter().filter(|a| a.is_active()).count(), 1);
        assert_eq!(attempts[1].id, second.id);
        assert_eq!(attempts[1].gas_price, GasPrice::Legacy(U256::from(12)));

        let in_flight = store.in_flight(chain_id).await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].active_attempt().map(|a| a.id), Some(second.id));
        assert_eq!(in_flight[0].escalations(), 1);
    }

    #[tokio::test]
    async fn test_terminal_transactions_keep_no_active_attempt() {
        let Some(store) = store().await else { return };
        let chain_id = isolated_chain();
        let sender = Address::random();
        let finalized = store.insert_transaction(request(chain_id, sender)).await.unwrap();
        let failed = store.insert_transaction(request(chain_id, sender)).await.unwrap();

        store.mark_broadcast(finalized.id, attempt(0, 10)).await.unwrap();
        store.mark_confirmed(finalized.id, receipt(101)).await.unwrap();
        assert!(store.mark_finalized(finalized.id).await.unwrap());
        store.mark_broadcast(failed.id, attempt(1, 10)).await.unwrap();
        assert!(store.mark_fatal(failed.id, "bump depth reached").await.unwrap());

        for tx_id in [finalized.id, failed.id] {
            let attempts = store.attempts(tx_id).await.unwrap();
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].state, AttemptState::Closed);
        }
        assert!(store.in_flight(chain_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonce_bookkeeping() {
        let Some(store) = store().await else { return };
        let chain_id = isolated_chain();
        let sender = Address::random();
        assert!(store.load_nonce_cursor(chain_id, sender).await.unwrap().is_none());

        let a = store.insert_transaction(request(chain_id, sender)).await.unwrap();
        let b = store.insert_transaction(request(chain_id, sender)).await.unwrap();
        store.mark_broadcast(a.id, attempt(3, 10)).await.unwrap();
        store.mark_broadcast(b.id, attempt(4, 10)).await.unwrap();
        store.mark_fatal(b.id, "fee ceiling reached").await.unwrap();
        assert_eq!(store.max_assigned_nonce(chain_id, sender).await.unwrap(), Some(3));

        for next_nonce in [4, 5] {
            store
                .save_nonce_cursor(NonceCursor {
                    chain_id,
                    address: sender,
                    next_nonce,
                })
                .await
                .unwrap();
        }
        let cursor = store.load_nonce_cursor(chain_id, sender).await.unwrap().unwrap();
        assert_eq!(cursor.next_nonce, 5);
    }

    #[tokio::test]
    async fn test_reap_only_terminal_rows() {
        let Some(store) = store().await else { return };
        let chain_id = isolated_chain();
        let sender = Address::random();
        let done = store.insert_transaction(request(chain_id, sender)).await.unwrap();
        let pending = store.insert_transaction(request(chain_id, sender)).await.unwrap();
        store.mark_broadcast(done.id, attempt(0, 10)).await.unwrap();
        store.mark_fatal(done.id, "rejected").await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.reap(chain_id, cutoff, 10).await.unwrap(), 1);
        assert!(store.get_transaction(done.id).await.unwrap().is_none());
        assert!(store.attempts(done.id).await.unwrap().is_empty());
        assert!(store.get_transaction(pending.id).await.unwrap().is_some());
    }
}
