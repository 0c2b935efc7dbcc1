//! PostgreSQL storage backend.
//!
//! Persists blocks, transactions, and logs through chunked `UNNEST`
//! column-array inserts inside a single transaction. Inserts are
//! idempotent; a block-number collision with a different hash deliberately
//! violates the `hash NOT NULL` constraint so a reorg surfaces as a
//! distinguishable SQLSTATE instead of silently overwriting history.

use crate::fetch::records::{BlockRecord, LogRecord, TxRecord};
use crate::store::error::StoreError;
use crate::store::BlockWriter;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Upper bound on rows per bulk insert; larger arrays are split.
const MAX_ROWS_PER_INSERT: usize = 1_000;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS blocks (
        number           BIGINT PRIMARY KEY,
        hash             TEXT NOT NULL,
        parent_hash      TEXT NOT NULL,
        "timestamp"      TIMESTAMPTZ NOT NULL,
        miner            TEXT,
        gas_used         NUMERIC(78,0) NOT NULL,
        gas_limit        NUMERIC(78,0) NOT NULL,
        base_fee_per_gas NUMERIC(78,0),
        tx_count         INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transactions (
        hash         TEXT PRIMARY KEY,
        block_number BIGINT NOT NULL REFERENCES blocks(number) ON DELETE CASCADE,
        tx_index     INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address   TEXT,
        value        NUMERIC(78,0) NOT NULL,
        gas          NUMERIC(78,0) NOT NULL,
        gas_price    NUMERIC(78,0),
        nonce        BIGINT NOT NULL,
        input        TEXT NOT NULL,
        status       SMALLINT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS logs (
        transaction_hash TEXT NOT NULL REFERENCES transactions(hash) ON DELETE CASCADE,
        log_index        INTEGER NOT NULL,
        block_number     BIGINT NOT NULL REFERENCES blocks(number) ON DELETE CASCADE,
        address          TEXT NOT NULL,
        data             TEXT NOT NULL,
        topic0           TEXT,
        topic1           TEXT,
        topic2           TEXT,
        topic3           TEXT,
        PRIMARY KEY (transaction_hash, log_index)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions(block_number)",
    "CREATE INDEX IF NOT EXISTS idx_logs_block ON logs(block_number)",
];

/// Thread-safe and cheaply cloneable; wraps a bounded connection pool.
#[derive(Clone)]
pub struct PgBlockStore {
    pool: PgPool,
}

impl PgBlockStore {
    /// Connect with a bounded pool and make sure the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(StoreError::from)?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!("block store connected and schema initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)?;
        }
        Ok(())
    }

    /// The underlying pool, for custom queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_blocks(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        blocks: &[BlockRecord],
    ) -> Result<(), StoreError> {
        let mut numbers = Vec::with_capacity(blocks.len());
        let mut hashes = Vec::with_capacity(blocks.len());
        let mut parents = Vec::with_capacity(blocks.len());
        let mut timestamps = Vec::with_capacity(blocks.len());
        let mut miners = Vec::with_capacity(blocks.len());
        let mut gas_used = Vec::with_capacity(blocks.len());
        let mut gas_limits = Vec::with_capacity(blocks.len());
        let mut base_fees = Vec::with_capacity(blocks.len());
        let mut tx_counts = Vec::with_capacity(blocks.len());
        for block in blocks {
            numbers.push(block.number as i64);
            hashes.push(block.hash.clone());
            parents.push(block.parent_hash.clone());
            timestamps.push(block.timestamp);
            miners.push(block.miner.clone());
            gas_used.push(block.gas_used.clone());
            gas_limits.push(block.gas_limit.clone());
            base_fees.push(block.base_fee_per_gas.clone());
            tx_counts.push(block.tx_count);
        }

        // On a number collision the update path assigns NULL to hash, but
        // only when the stored hash differs from the incoming one. Same
        // hash: the WHERE fails and the row is left alone. Different hash:
        // the NOT NULL constraint fires and the caller sees a reorg.
        sqlx::query(
            r#"INSERT INTO blocks
                   (number, hash, parent_hash, "timestamp", miner, gas_used, gas_limit, base_fee_per_gas, tx_count)
               SELECT number, hash, parent_hash, ts, miner, gas_used::numeric, gas_limit::numeric, base_fee::numeric, tx_count
               FROM UNNEST($1::bigint[], $2::text[], $3::text[], $4::timestamptz[], $5::text[], $6::text[], $7::text[], $8::text[], $9::int[])
                   AS t(number, hash, parent_hash, ts, miner, gas_used, gas_limit, base_fee, tx_count)
               ON CONFLICT (number) DO UPDATE
                   SET hash = NULL
                   WHERE blocks.hash IS DISTINCT FROM EXCLUDED.hash"#,
        )
        .bind(&numbers)
        .bind(&hashes)
        .bind(&parents)
        .bind(&timestamps)
        .bind(&miners)
        .bind(&gas_used)
        .bind(&gas_limits)
        .bind(&base_fees)
        .bind(&tx_counts)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn insert_transactions(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        records: &[TxRecord],
    ) -> Result<(), StoreError> {
        let mut hashes = Vec::with_capacity(records.len());
        let mut block_numbers = Vec::with_capacity(records.len());
        let mut indexes = Vec::with_capacity(records.len());
        let mut froms = Vec::with_capacity(records.len());
        let mut tos = Vec::with_capacity(records.len());
        let mut values = Vec::with_capacity(records.len());
        let mut gas = Vec::with_capacity(records.len());
        let mut gas_prices = Vec::with_capacity(records.len());
        let mut nonces = Vec::with_capacity(records.len());
        let mut inputs = Vec::with_capacity(records.len());
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            hashes.push(record.hash.clone());
            block_numbers.push(record.block_number as i64);
            indexes.push(record.tx_index);
            froms.push(record.from_address.clone());
            tos.push(record.to_address.clone());
            values.push(record.value.clone());
            gas.push(record.gas.clone());
            gas_prices.push(record.gas_price.clone());
            nonces.push(record.nonce as i64);
            inputs.push(record.input.clone());
            statuses.push(record.status);
        }

        sqlx::query(
            r#"INSERT INTO transactions
                   (hash, block_number, tx_index, from_address, to_address, value, gas, gas_price, nonce, input, status)
               SELECT hash, block_number, tx_index, from_address, to_address, value::numeric, gas::numeric, gas_price::numeric, nonce, input, status
               FROM UNNEST($1::text[], $2::bigint[], $3::int[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[], $9::bigint[], $10::text[], $11::smallint[])
                   AS t(hash, block_number, tx_index, from_address, to_address, value, gas, gas_price, nonce, input, status)
               ON CONFLICT (hash) DO NOTHING"#,
        )
        .bind(&hashes)
        .bind(&block_numbers)
        .bind(&indexes)
        .bind(&froms)
        .bind(&tos)
        .bind(&values)
        .bind(&gas)
        .bind(&gas_prices)
        .bind(&nonces)
        .bind(&inputs)
        .bind(&statuses)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn insert_logs(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        records: &[LogRecord],
    ) -> Result<(), StoreError> {
        let mut tx_hashes = Vec::with_capacity(records.len());
        let mut indexes = Vec::with_capacity(records.len());
        let mut block_numbers = Vec::with_capacity(records.len());
        let mut addresses = Vec::with_capacity(records.len());
        let mut data = Vec::with_capacity(records.len());
        let mut topic0 = Vec::with_capacity(records.len());
        let mut topic1 = Vec::with_capacity(records.len());
        let mut topic2 = Vec::with_capacity(records.len());
        let mut topic3 = Vec::with_capacity(records.len());
        for record in records {
            tx_hashes.push(record.transaction_hash.clone());
            indexes.push(record.log_index);
            block_numbers.push(record.block_number as i64);
            addresses.push(record.address.clone());
            data.push(record.data.clone());
            topic0.push(record.topic0.clone());
            topic1.push(record.topic1.clone());
            topic2.push(record.topic2.clone());
            topic3.push(record.topic3.clone());
        }

        sqlx::query(
            r#"INSERT INTO logs
                   (transaction_hash, log_index, block_number, address, data, topic0, topic1, topic2, topic3)
               SELECT * FROM UNNEST($1::text[], $2::int[], $3::bigint[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[], $9::text[])
               ON CONFLICT (transaction_hash, log_index) DO NOTHING"#,
        )
        .bind(&tx_hashes)
        .bind(&indexes)
        .bind(&block_numbers)
        .bind(&addresses)
        .bind(&data)
        .bind(&topic0)
        .bind(&topic1)
        .bind(&topic2)
        .bind(&topic3)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl BlockWriter for PgBlockStore {
    async fn save(
        &self,
        blocks: &[BlockRecord],
        txs: &[TxRecord],
        logs: &[LogRecord],
    ) -> Result<(), StoreError> {
        if blocks.is_empty() && txs.is_empty() && logs.is_empty() {
            return Ok(());
        }

        let mut db_tx = self.pool.begin().await.map_err(StoreError::from)?;

        for chunk in blocks.chunks(MAX_ROWS_PER_INSERT) {
            Self::insert_blocks(&mut db_tx, chunk).await?;
        }
        for chunk in txs.chunks(MAX_ROWS_PER_INSERT) {
            Self::insert_transactions(&mut db_tx, chunk).await?;
        }
        for chunk in logs.chunks(MAX_ROWS_PER_INSERT) {
            Self::insert_logs(&mut db_tx, chunk).await?;
        }


        db_tx.commit().await.map_err(StoreError::from)?;
        tracing::debug!(
            blocks = blocks.len(),
            transactions = txs.len(),
            logs = logs.len(),
            "bulk save committed"
        );
        Ok(())
    }
}
