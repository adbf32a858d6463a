//! PostgreSQL transfer store

use super::store::{TransferStats, TransferStore};
use crate::chain::ChainId;
use crate::config::DatabaseConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::EventKind;
use crate::relay::{Transfer, TransferStatus};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Transfer store backed by PostgreSQL. The durable backend: non-terminal
/// transfers survive process restart.
pub struct PgTransferStore {
    pool: PgPool,
}

impl PgTransferStore {
    pub async fn new(config: &DatabaseConfig) -> RelayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayError::Database)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl TransferStore for PgTransferStore {
    async fn migrate(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                origin_tx_hash VARCHAR(66) PRIMARY KEY,
                source_chain VARCHAR(8) NOT NULL,
                destination_chain VARCHAR(8) NOT NULL,
                source_address VARCHAR(42) NOT NULL,
                destination_address VARCHAR(42) NOT NULL,
                amount TEXT NOT NULL,
                status VARCHAR(16) NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                failure_reason TEXT,
                acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_status
            ON transfers (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain VARCHAR(8) NOT NULL,
                event_kind VARCHAR(32) NOT NULL,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain, event_kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn insert_new(&self, transfer: &Transfer) -> RelayResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers
                (origin_tx_hash, source_chain, destination_chain,
                 source_address, destination_address, amount, status, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (origin_tx_hash) DO NOTHING
            "#,
        )
        .bind(format!("{:?}", transfer.origin_tx_hash))
        .bind(transfer.source_chain.as_str())
        .bind(transfer.destination_chain.as_str())
        .bind(format!("{:?}", transfer.source_address))
        .bind(format!("{:?}", transfer.destination_address))
        .bind(transfer.amount.to_string())
        .bind(transfer.status.as_str())
        .bind(transfer.attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, origin_tx_hash: H256) -> RelayResult<Option<Transfer>> {
        let row = sqlx::query(
            "SELECT * FROM transfers WHERE origin_tx_hash = $1",
        )
        .bind(format!("{:?}", origin_tx_hash))
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_transfer).transpose()
    }

    async fn update(&self, transfer: &Transfer) -> RelayResult<()> {
        sqlx::query(
            r#"
            UPDATE transfers
            SET status = $2, attempts = $3, failure_reason = $4,
                acknowledged = $5, updated_at = NOW()
            WHERE origin_tx_hash = $1
            "#,
        )
        .bind(format!("{:?}", transfer.origin_tx_hash))
        .bind(transfer.status.as_str())
        .bind(transfer.attempts as i32)
        .bind(transfer.failure_reason.as_deref())
        .bind(transfer.acknowledged)
        .execute(&self.pool)
        .await?;

        debug!(
            "Persisted transfer {:?}: {}",
            transfer.origin_tx_hash, transfer.status
        );
        Ok(())
    }

    async fn non_terminal(&self) -> RelayResult<Vec<Transfer>> {
        let rows = sqlx::query(
            "SELECT * FROM transfers WHERE status NOT IN ('settled', 'failed')",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_transfer).collect()
    }

    async fn list(&self, status: Option<TransferStatus>) -> RelayResult<Vec<Transfer>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM transfers WHERE status = $1 ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM transfers ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(row_to_transfer).collect()
    }

    async fn acknowledge(&self, origin_tx_hash: H256) -> RelayResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET acknowledged = TRUE, updated_at = NOW()
            WHERE origin_tx_hash = $1 AND status = 'failed'
            "#,
        )
        .bind(format!("{:?}", origin_tx_hash))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_checkpoint(&self, chain: ChainId, kind: EventKind) -> RelayResult<u64> {
        let row = sqlx::query(
            "SELECT block_number FROM chain_checkpoints WHERE chain = $1 AND event_kind = $2",
        )
        .bind(chain.as_str())
        .bind(kind.name())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.get::<i64, _>("block_number") as u64)
            .unwrap_or(0))
    }

    async fn save_checkpoint(
        &self,
        chain: ChainId,
        kind: EventKind,
        block: u64,
    ) -> RelayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, event_kind, block_number, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (chain, event_kind)
            DO UPDATE SET block_number = $3, updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(kind.name())
        .bind(block as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stats(&self) -> RelayResult<TransferStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'observed') as observed,
                COUNT(*) FILTER (WHERE status = 'dispatched') as dispatched,
                COUNT(*) FILTER (WHERE status = 'settled') as settled,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM transfers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TransferStats {
            observed: row.get::<i64, _>("observed") as u64,
            dispatched: row.get::<i64, _>("dispatched") as u64,
            settled: row.get::<i64, _>("settled") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    async fn health_check(&self) -> RelayResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(RelayError::Database)?;
        Ok(())
    }
}

fn row_to_transfer(row: sqlx::postgres::PgRow) -> RelayResult<Transfer> {
    let origin: String = row.get("origin_tx_hash");
    let source_chain: String = row.get("source_chain");
    let destination_chain: String = row.get("destination_chain");
    let source_address: String = row.get("source_address");
    let destination_address: String = row.get("destination_address");
    let amount: String = row.get("amount");
    let status: String = row.get("status");

    Ok(Transfer {
        origin_tx_hash: parse_col::<H256>(&origin, "origin_tx_hash")?,
        source_chain: source_chain
            .parse::<ChainId>()
            .map_err(RelayError::Internal)?,
        destination_chain: destination_chain
            .parse::<ChainId>()
            .map_err(RelayError::Internal)?,
        source_address: parse_col::<Address>(&source_address, "source_address")?,
        destination_address: parse_col::<Address>(&destination_address, "destination_address")?,
        amount: U256::from_dec_str(&amount)
            .map_err(|e| RelayError::Internal(format!("bad amount column: {}", e)))?,
        status: TransferStatus::from_str(&status)
            .ok_or_else(|| RelayError::Internal(format!("bad status column: {}", status)))?,
        attempts: row.get::<i32, _>("attempts") as u32,
        failure_reason: row.get("failure_reason"),
        acknowledged: row.get("acknowledged"),
    })
}

fn parse_col<T>(value: &str, column: &str) -> RelayResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| RelayError::Internal(format!("bad {} column: {}", column, e)))
}
