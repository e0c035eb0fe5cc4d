use crate::settings::DatabaseSettings;
use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Connection, Pool, Postgres};
use std::env;
use std::time::Duration;

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Schema holding reservations, arbitrages and cancellation flags.
pub const SCHEMA: &str = "backfill";

/// Connects with capped exponential backoff, then makes sure the schema exists.
pub async fn connect(settings: &DatabaseSettings) -> Result<DbPool> {
    let database_url = settings
        .url
        .clone()
        .or_else(|| env::var("DATABASE_URL").ok())
        .context("DATABASE_URL must be set (or database.url in Config.toml)")?;

    let max_attempts = settings.connect_attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_seconds))
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "Connected to database (attempt {}/{}).",
                    attempt,
                    max_attempts
                );
                match initialize_database(&pool).await {
                    Ok(()) => return Ok(pool),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(e) => last_err = Some(e.into()),
        }
        if attempt == max_attempts {
            break;
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms .. 12.8s
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

/// Idempotent schema creation, serialized across workers by an advisory lock.
pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x4241434B46494C4C; // "BACKFILL"

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&mut *tx)
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(&mut *tx)
        .await?;

    create_tables(&mut tx).await?;

    tx.commit().await?;
    log::info!("Database schema `{}` is ready.", SCHEMA);
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.reservations (
            id BIGSERIAL PRIMARY KEY,
            from_block BIGINT NOT NULL CHECK (from_block >= 0),
            to_block_exclusive BIGINT NOT NULL,
            started_on TIMESTAMPTZ NULL,
            finished_on TIMESTAMPTZ NULL,
            CHECK (from_block < to_block_exclusive)
        )",
        SCHEMA
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS reservations_unclaimed_idx
         ON {}.reservations (id)
         WHERE started_on IS NULL AND finished_on IS NULL",
        SCHEMA
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.arbitrages (
            id BIGSERIAL PRIMARY KEY,
            tx_hash VARCHAR(66) UNIQUE NOT NULL,
            block_number BIGINT NOT NULL,
            account VARCHAR(42) NOT NULL,
            profit_token VARCHAR(42) NOT NULL,
            profit_amount NUMERIC(78, 0) NOT NULL,
            tokens TEXT[] NOT NULL,
            transfer_count INTEGER NOT NULL,
            discovered_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        SCHEMA
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS arbitrages_block_number_idx
         ON {}.arbitrages (block_number)",
        SCHEMA
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.worker_cancellations (
            job_name TEXT NOT NULL,
            worker_name TEXT NOT NULL,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (job_name, worker_name)
        )",
        SCHEMA
    ))
    .execute(&mut **tx)
    .await?;

    Ok(())
}
