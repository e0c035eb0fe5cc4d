use super::planner::{plan_bootstrap, shuffled};
use super::{
    check_split, BlockRange, BootstrapReport, BootstrapRequest, Reservation, ReservationStore,
    ReservationSummary,
};
use crate::database::{DbPool, SCHEMA};
use crate::error::ReservationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

const COLUMNS: &str = "id, from_block, to_block_exclusive, started_on, finished_on";

/// Reservation store backed by `backfill.reservations`.
#[derive(Debug, Clone)]
pub struct PgReservationStore {
    pool: DbPool,
}

impl PgReservationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Explains why a conditional update on `id` touched no row.
    async fn diagnose(&self, id: i64) -> ReservationError {
        let row = sqlx::query(&format!(
            "SELECT started_on, finished_on FROM {}.reservations WHERE id = $1",
            SCHEMA
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Err(e) => ReservationError::Database(e),
            Ok(None) => ReservationError::NotFound(id),
            Ok(Some(row)) => {
                let started_on: Option<DateTime<Utc>> = row.try_get("started_on").ok().flatten();
                let finished_on: Option<DateTime<Utc>> =
                    row.try_get("finished_on").ok().flatten();
                match (started_on, finished_on) {
                    (_, Some(_)) => ReservationError::AlreadyFinished(id),
                    (None, None) => ReservationError::NotClaimed(id),
                    // claimed and unfinished again: another worker raced us on this row
                    (Some(_), None) => ReservationError::DoubleClaim(id),
                }
            }
        }
    }
}

fn to_db(block: u64) -> Result<i64, ReservationError> {
    i64::try_from(block)
        .map_err(|_| ReservationError::InvalidRange(format!("block {} exceeds BIGINT", block)))
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, sqlx::Error> {
    Ok(Reservation {
        id: row.try_get("id")?,
        from_block: row.try_get::<i64, _>("from_block")? as u64,
        to_block_exclusive: row.try_get::<i64, _>("to_block_exclusive")? as u64,
        started_on: row.try_get("started_on")?,
        finished_on: row.try_get("finished_on")?,
    })
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn claim(&self) -> Result<Option<Reservation>, ReservationError> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query(&format!(
            "SELECT {} FROM {}.reservations
             WHERE started_on IS NULL AND finished_on IS NULL
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
            COLUMNS, SCHEMA
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let mut reservation = match candidate {
            Some(row) => reservation_from_row(&row)?,
            None => {
                tx.commit().await?;
                return Ok(None);
            }
        };

        let started_on: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
            "UPDATE {}.reservations SET started_on = now()
             WHERE id = $1 AND started_on IS NULL AND finished_on IS NULL
             RETURNING started_on",
            SCHEMA
        ))
        .bind(reservation.id)
        .fetch_optional(&mut *tx)
        .await?;

        // the row is locked by us, so losing it here means the lock did not hold
        let started_on = started_on.ok_or(ReservationError::DoubleClaim(reservation.id))?;
        tx.commit().await?;

        reservation.started_on = Some(started_on);
        log::debug!(
            "Claimed reservation {} {}",
            reservation.id,
            reservation.range()
        );
        Ok(Some(reservation))
    }

    async fn complete(&self, id: i64) -> Result<(), ReservationError> {
        let result = sqlx::query(&format!(
            "UPDATE {}.reservations SET finished_on = now()
             WHERE id = $1 AND started_on IS NOT NULL AND finished_on IS NULL",
            SCHEMA
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(self.diagnose(id).await);
        }
        Ok(())
    }

    async fn release(&self, id: i64) -> Result<(), ReservationError> {
        let result = sqlx::query(&format!(
            "UPDATE {}.reservations SET started_on = NULL
             WHERE id = $1 AND started_on IS NOT NULL AND finished_on IS NULL",
            SCHEMA
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(self.diagnose(id).await);
        }
        Ok(())
    }

    async fn split(&self, id: i64, remaining_start: u64) -> Result<i64, ReservationError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM {}.reservations WHERE id = $1 FOR UPDATE",
            COLUMNS, SCHEMA
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ReservationError::NotFound(id))?;
        let current = reservation_from_row(&row)?;

        if current.is_finished() {
            return Err(ReservationError::AlreadyFinished(id));
        }
        if current.started_on.is_none() {
            return Err(ReservationError::NotClaimed(id));
        }
        check_split(
            id,
            current.from_block,
            current.to_block_exclusive,
            remaining_start,
        )?;

        sqlx::query(&format!(
            "UPDATE {}.reservations
             SET finished_on = now(), to_block_exclusive = $2
             WHERE id = $1",
            SCHEMA
        ))
        .bind(id)
        .bind(to_db(remaining_start)?)
        .execute(&mut *tx)
        .await?;

        let new_id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {}.reservations (from_block, to_block_exclusive)
             VALUES ($1, $2)
             RETURNING id",
            SCHEMA
        ))
        .bind(to_db(remaining_start)?)
        .bind(to_db(current.to_block_exclusive)?)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(new_id)
    }

    async fn bootstrap(
        &self,
        request: BootstrapRequest,
    ) -> Result<BootstrapReport, ReservationError> {
        let mut tx = self.pool.begin().await?;

        // one bootstrap at a time, so the span read below stays accurate
        sqlx::query(&format!(
            "LOCK TABLE {}.reservations IN SHARE ROW EXCLUSIVE MODE",
            SCHEMA
        ))
        .execute(&mut *tx)
        .await?;

        let span = sqlx::query(&format!(
            "SELECT MIN(from_block) AS from_block, MAX(to_block_exclusive) AS to_block_exclusive
             FROM {}.reservations",
            SCHEMA
        ))
        .fetch_one(&mut *tx)
        .await?;
        let from: Option<i64> = span.try_get("from_block")?;
        let to: Option<i64> = span.try_get("to_block_exclusive")?;
        let existing = match (from, to) {
            (Some(from), Some(to)) => Some(BlockRange::new(from as u64, to as u64)),
            _ => None,
        };

        let planned = shuffled(plan_bootstrap(
            existing,
            request.start_block,
            request.end_block_inclusive,
            request.chunk_size,
        )?);

        if !planned.is_empty() {
            let starts = planned
                .iter()
                .map(|r| to_db(r.from_block))
                .collect::<Result<Vec<_>, _>>()?;
            let ends = planned
                .iter()
                .map(|r| to_db(r.to_block_exclusive))
                .collect::<Result<Vec<_>, _>>()?;
            sqlx::query(&format!(
                "INSERT INTO {}.reservations (from_block, to_block_exclusive)
                 SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[])",
                SCHEMA
            ))
            .bind(&starts)
            .bind(&ends)
            .execute(&mut *tx)
            .await?;
        }

        if request.dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        Ok(BootstrapReport {
            existing,
            inserted: planned,
            committed: !request.dry_run,
        })
    }

    async fn summary(&self) -> Result<ReservationSummary, ReservationError> {
        let row = sqlx::query(&format!(
            "SELECT
                COUNT(*) FILTER (WHERE started_on IS NULL AND finished_on IS NULL) AS unclaimed,
                COUNT(*) FILTER (WHERE started_on IS NOT NULL AND finished_on IS NULL) AS in_progress,
                COUNT(*) FILTER (WHERE finished_on IS NOT NULL) AS finished,
                COALESCE(SUM(to_block_exclusive - from_block)
                    FILTER (WHERE finished_on IS NOT NULL), 0)::BIGINT AS finished_blocks,
                COALESCE(SUM(to_block_exclusive - from_block), 0)::BIGINT AS total_blocks
             FROM {}.reservations",
            SCHEMA
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(ReservationSummary {
            unclaimed: row.try_get::<i64, _>("unclaimed")? as u64,
            in_progress: row.try_get::<i64, _>("in_progress")? as u64,
            finished: row.try_get::<i64, _>("finished")? as u64,
            finished_blocks: row.try_get::<i64, _>("finished_blocks")? as u64,
            total_blocks: row.try_get::<i64, _>("total_blocks")? as u64,
        })
    }
}
