//! # Block-Range Reservations
//!
//! The overall historical range is partitioned into half-open reservations
//! `[from_block, to_block_exclusive)`. A reservation is unclaimed
//! (`started_on` null), claimed (`started_on` set, `finished_on` null) or
//! finished (`finished_on` set).
//!
//! Every claimed reservation is resolved exactly once, through
//! [`ReservationStore::resolve`]:
//!
//! - **Completed**: the whole range was processed, `finished_on` is set.
//! - **Released**: nothing was processed, `started_on` goes back to null.
//! - **Split**: a prefix was processed. The reservation is finished with its
//!   end truncated to the first unprocessed block and a new unclaimed
//!   reservation covers the rest.
//!
//! ## Implementations
//!
//! - [`PgReservationStore`]: Postgres, claims with `FOR UPDATE SKIP LOCKED`.
//! - [`InMemoryReservationStore`]: same contract behind a mutex.

pub mod memory;
pub mod planner;
pub mod postgres;

pub use memory::InMemoryReservationStore;
pub use planner::{chunk_range, plan_bootstrap};
pub use postgres::PgReservationStore;

use crate::error::ReservationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: i64,
    pub from_block: u64,
    pub to_block_exclusive: u64,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn range(&self) -> BlockRange {
        BlockRange::new(self.from_block, self.to_block_exclusive)
    }

    pub fn len(&self) -> u64 {
        self.to_block_exclusive.saturating_sub(self.from_block)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_claimed(&self) -> bool {
        self.started_on.is_some() && self.finished_on.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }
}

/// Half-open block interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockRange {
    pub from_block: u64,
    pub to_block_exclusive: u64,
}

impl BlockRange {
    pub fn new(from_block: u64, to_block_exclusive: u64) -> Self {
        Self {
            from_block,
            to_block_exclusive,
        }
    }

    pub fn len(&self) -> u64 {
        self.to_block_exclusive.saturating_sub(self.from_block)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from_block, self.to_block_exclusive)
    }
}

/// How the worker left a claimed reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Completed,
    /// Processing stopped before the end; `remaining_start` is the first
    /// block that was not processed.
    Cancelled { remaining_start: u64 },
}

/// What the store did with a resolved reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Released,
    Split { new_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub start_block: u64,
    pub end_block_inclusive: u64,
    pub chunk_size: u64,
    /// Plan and report the chunks without committing them.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// Span covered before this call, if any reservations existed.
    pub existing: Option<BlockRange>,
    /// New chunks, in insertion order.
    pub inserted: Vec<BlockRange>,
    pub committed: bool,
}

impl BootstrapReport {
    pub fn inserted_blocks(&self) -> u64 {
        self.inserted.iter().map(BlockRange::len).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReservationSummary {
    pub unclaimed: u64,
    pub in_progress: u64,
    pub finished: u64,
    pub finished_blocks: u64,
    pub total_blocks: u64,
}

impl ReservationSummary {
    pub fn total(&self) -> u64 {
        self.unclaimed + self.in_progress + self.finished
    }
}

/// Durable partition of the block range into leasable reservations.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Claims one unclaimed reservation. `None` means nothing is left to claim
    /// anywhere in the range.
    async fn claim(&self) -> Result<Option<Reservation>, ReservationError>;

    async fn complete(&self, id: i64) -> Result<(), ReservationError>;

    async fn release(&self, id: i64) -> Result<(), ReservationError>;

    /// Finishes `[from, remaining_start)` and inserts an unclaimed
    /// `[remaining_start, to)`. Returns the new reservation id.
    async fn split(&self, id: i64, remaining_start: u64) -> Result<i64, ReservationError>;

    async fn bootstrap(
        &self,
        request: BootstrapRequest,
    ) -> Result<BootstrapReport, ReservationError>;

    async fn summary(&self) -> Result<ReservationSummary, ReservationError>;

    /// Applies `outcome` to a claimed reservation.
    async fn resolve(
        &self,
        reservation: &Reservation,
        outcome: ReservationOutcome,
    ) -> Result<Resolution, ReservationError> {
        match outcome {
            ReservationOutcome::Completed => {
                self.complete(reservation.id).await?;
                Ok(Resolution::Completed)
            }
            ReservationOutcome::Cancelled { remaining_start }
                if remaining_start <= reservation.from_block =>
            {
                self.release(reservation.id).await?;
                Ok(Resolution::Released)
            }
            ReservationOutcome::Cancelled { remaining_start }
                if remaining_start >= reservation.to_block_exclusive =>
            {
                self.complete(reservation.id).await?;
                Ok(Resolution::Completed)
            }
            ReservationOutcome::Cancelled { remaining_start } => {
                let new_id = self.split(reservation.id, remaining_start).await?;
                Ok(Resolution::Split { new_id })
            }
        }
    }
}

/// Split precondition: `from_block < remaining_start < to_block_exclusive`.
pub(crate) fn check_split(
    id: i64,
    from_block: u64,
    to_block_exclusive: u64,
    remaining_start: u64,
) -> Result<(), ReservationError> {
    if from_block < remaining_start && remaining_start < to_block_exclusive {
        Ok(())
    } else {
        Err(ReservationError::InvalidSplit {
            id,
            from_block,
            to_block_exclusive,
            remaining_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_split_bounds() {
        assert!(check_split(1, 100, 200, 150).is_ok());
        assert!(check_split(1, 100, 200, 199).is_ok());
        assert!(matches!(
            check_split(1, 100, 200, 100),
            Err(ReservationError::InvalidSplit { .. })
        ));
        assert!(check_split(1, 100, 200, 200).is_err());
        assert!(check_split(1, 100, 200, 250).is_err());
    }

    #[test]
    fn test_block_range_display() {
        assert_eq!(BlockRange::new(100, 200).to_string(), "[100, 200)");
        assert_eq!(BlockRange::new(100, 200).len(), 100);
    }

    #[tokio::test]
    async fn test_resolve_dispatch() {
        let store = InMemoryReservationStore::from_ranges(&[
            BlockRange::new(0, 10),
            BlockRange::new(10, 20),
            BlockRange::new(20, 30),
        ]);
        let mut claimed = Vec::new();
        while let Some(r) = store.claim().await.unwrap() {
            claimed.push(r);
        }
        claimed.sort_by_key(|r| r.from_block);

        let completed = store
            .resolve(&claimed[0], ReservationOutcome::Completed)
            .await
            .unwrap();
        assert_eq!(completed, Resolution::Completed);

        let released = store
            .resolve(
                &claimed[1],
                ReservationOutcome::Cancelled {
                    remaining_start: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(released, Resolution::Released);

        let split = store
            .resolve(
                &claimed[2],
                ReservationOutcome::Cancelled {
                    remaining_start: 25,
                },
            )
            .await
            .unwrap();
        assert!(matches!(split, Resolution::Split { .. }));

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.finished, 2);
        assert_eq!(summary.unclaimed, 2);
        assert_eq!(summary.finished_blocks, 15);
        assert_eq!(summary.total_blocks, 30);
    }
}
