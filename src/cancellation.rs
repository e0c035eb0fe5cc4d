//! Cooperative cancellation.
//!
//! The worker only reads a boolean. Operators flip the durable flag in
//! `backfill.worker_cancellations` (see the `cancel` command); a background
//! task polls it into a [`CancellationToken`]. Ctrl+C trips the same token.

use crate::database::{DbPool, SCHEMA};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub trait CancellationSignal: Send + Sync {
    fn cancel_requested(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn set(&self, cancelled: bool) {
        self.flag.store(cancelled, Ordering::SeqCst);
    }
}

impl CancellationSignal for CancellationToken {
    fn cancel_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Current value of the durable flag; a missing row means "not cancelled".
pub async fn read_flag(pool: &DbPool, job_name: &str, worker_name: &str) -> Result<bool, sqlx::Error> {
    let flag: Option<bool> = sqlx::query_scalar(&format!(
        "SELECT cancel_requested FROM {}.worker_cancellations
         WHERE job_name = $1 AND worker_name = $2",
        SCHEMA
    ))
    .bind(job_name)
    .bind(worker_name)
    .fetch_optional(pool)
    .await?;
    Ok(flag.unwrap_or(false))
}

/// Sets or clears the durable flag for one worker.
pub async fn request_cancel(
    pool: &DbPool,
    job_name: &str,
    worker_name: &str,
    cancel: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {}.worker_cancellations (job_name, worker_name, cancel_requested, updated_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (job_name, worker_name)
         DO UPDATE SET cancel_requested = EXCLUDED.cancel_requested, updated_at = now()",
        SCHEMA
    ))
    .bind(job_name)
    .bind(worker_name)
    .bind(cancel)
    .execute(pool)
    .await?;
    Ok(())
}

/// Polls the durable flag into `token` every `period`. Once cancelled, the
/// token stays cancelled; poll errors keep the last known value.
pub fn spawn_poller(
    pool: DbPool,
    job_name: String,
    worker_name: String,
    token: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match read_flag(&pool, &job_name, &worker_name).await {
                Ok(true) => {
                    log::warn!(
                        "Cancellation requested for {}/{}",
                        job_name,
                        worker_name
                    );
                    token.cancel();
                    return;
                }
                Ok(false) => {}
                Err(e) => log::warn!("Failed to poll cancellation flag: {}", e),
            }
        }
    })
}

/// Trips `token` on the first Ctrl+C.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Ctrl+C received, finishing the current window before stopping");
            token.cancel();
        }
    })
}
