//! PostgreSQL state manager

use super::record::TransactionRecord;
use super::store::TransactionStore;
use crate::config::DatabaseConfig;
use crate::error::{TxError, TxResult};
use crate::events::TxEvent;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// State manager for PostgreSQL persistence of transaction records
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> TxResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(TxError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id BIGINT PRIMARY KEY,
                chain VARCHAR(64) NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                nonce BIGINT,
                status VARCHAR(20) NOT NULL,
                tx_hash VARCHAR(66),
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_wallet_transactions_sender
            ON wallet_transactions (chain, from_address, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> TxResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(TxError::Database)?;
        Ok(())
    }

    /// Upsert a transaction record
    pub async fn save_transaction(&self, record: &TransactionRecord) -> TxResult<()> {
        let data = serde_json::to_value(record).map_err(|e| TxError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO wallet_transactions
                (id, chain, from_address, nonce, status, tx_hash, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id)
            DO UPDATE SET nonce = $4, status = $5, tx_hash = $6, record = $7, updated_at = NOW()
            "#,
        )
        .bind(record.id as i64)
        .bind(record.chain.as_str())
        .bind(format!("{:?}", record.from()))
        .bind(record.nonce().map(|n| n as i64))
        .bind(record.status.as_str())
        .bind(record.hash.map(|h| format!("{:?}", h)))
        .bind(data)
        .execute(&self.pool)
        .await?;

        debug!("Saved transaction {} ({})", record.id, record.status);
        Ok(())
    }

    /// Delete a transaction record
    pub async fn delete_transaction(&self, id: u64) -> TxResult<()> {
        sqlx::query("DELETE FROM wallet_transactions WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load all persisted records
    pub async fn load_transactions(&self) -> TxResult<Vec<TransactionRecord>> {
        let rows = sqlx::query("SELECT record FROM wallet_transactions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.get("record");
            match serde_json::from_value::<TransactionRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable transaction record: {}", e),
            }
        }

        Ok(records)
    }

    /// Mirror store events into the database until the store channel closes
    pub async fn run_persistence(&self, store: Arc<TransactionStore>) {
        let mut events = store.subscribe();

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Persistence lagged behind by {} events, resyncing", skipped);
                    self.resync(&store).await;
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let result = match &event {
                TxEvent::Removed { id } => self.delete_transaction(*id).await,
                event if event.changes_record() => match store.get_tx(event.id()).await {
                    Some(record) => self.save_transaction(&record).await,
                    None => Ok(()),
                },
                _ => Ok(()),
            };

            if let Err(e) = result {
                warn!("Failed to persist {} for transaction {}: {}", event.name(), event.id(), e);
            }
        }
    }

    async fn resync(&self, store: &TransactionStore) {
        let records = store
            .get_filtered_tx_list(&crate::state::TxFilter::default())
            .await;
        for record in records {
            if let Err(e) = self.save_transaction(&record).await {
                warn!("Failed to resync transaction {}: {}", record.id, e);
            }
        }
    }
}
