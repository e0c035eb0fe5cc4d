use crate::database::{DbPool, SCHEMA};
use crate::detector::Arbitrage;
use crate::error::PersistError;
use async_trait::async_trait;

#[async_trait]
pub trait ArbitrageSink: Send + Sync {
    /// Stores one window's arbitrages in a single durable operation.
    /// Returns the number of newly stored rows.
    async fn persist(&self, arbitrages: &[Arbitrage]) -> Result<usize, PersistError>;
}

/// Writes into `backfill.arbitrages`. Rows already present (same tx hash) are
/// left alone, so a window processed twice after a crash stores nothing new.
#[derive(Debug, Clone)]
pub struct PgArbitrageStore {
    pool: DbPool,
}

impl PgArbitrageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArbitrageSink for PgArbitrageStore {
    async fn persist(&self, arbitrages: &[Arbitrage]) -> Result<usize, PersistError> {
        if arbitrages.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for arb in arbitrages {
            let tokens: Vec<String> = arb.tokens.iter().map(|t| format!("{:?}", t)).collect();
            let block_number = i64::try_from(arb.block_number)
                .map_err(|_| PersistError::Other(format!("block {} overflows", arb.block_number)))?;
            let result = sqlx::query(&format!(
                "INSERT INTO {}.arbitrages
                    (tx_hash, block_number, account, profit_token, profit_amount, tokens, transfer_count)
                 VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7)
                 ON CONFLICT (tx_hash) DO NOTHING",
                SCHEMA
            ))
            .bind(format!("{:?}", arb.tx_hash))
            .bind(block_number)
            .bind(format!("{:?}", arb.account))
            .bind(format!("{:?}", arb.profit_token))
            .bind(arb.profit_amount.to_string())
            .bind(&tokens)
            .bind(arb.transfer_count as i32)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        log::debug!(
            "Persisted {} of {} arbitrages",
            inserted,
            arbitrages.len()
        );
        Ok(inserted as usize)
    }
}
