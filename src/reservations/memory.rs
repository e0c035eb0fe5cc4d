use super::planner::{plan_bootstrap, shuffled};
use super::{
    check_split, BlockRange, BootstrapReport, BootstrapRequest, Reservation, ReservationStore,
    ReservationSummary,
};
use crate::error::ReservationError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Process-local reservation store with the same contract as the Postgres one.
/// The mutex plays the role of the row locks.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    inner: Mutex<Rows>,
}

#[derive(Debug, Default)]
struct Rows {
    next_id: i64,
    rows: BTreeMap<i64, Reservation>,
}

impl Rows {
    fn insert(&mut self, range: BlockRange) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.rows.insert(
            id,
            Reservation {
                id,
                from_block: range.from_block,
                to_block_exclusive: range.to_block_exclusive,
                started_on: None,
                finished_on: None,
            },
        );
        id
    }

    fn span(&self) -> Option<BlockRange> {
        let from = self.rows.values().map(|r| r.from_block).min()?;
        let to = self.rows.values().map(|r| r.to_block_exclusive).max()?;
        Some(BlockRange::new(from, to))
    }

    fn claimed_mut(&mut self, id: i64) -> Result<&mut Reservation, ReservationError> {
        let row = self
            .rows
            .get_mut(&id)
            .ok_or(ReservationError::NotFound(id))?;
        if row.finished_on.is_some() {
            return Err(ReservationError::AlreadyFinished(id));
        }
        if row.started_on.is_none() {
            return Err(ReservationError::NotClaimed(id));
        }
        Ok(row)
    }
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with unclaimed reservations, inserted in the given order.
    pub fn from_ranges(ranges: &[BlockRange]) -> Self {
        let mut rows = Rows::default();
        for range in ranges {
            rows.insert(*range);
        }
        Self {
            inner: Mutex::new(rows),
        }
    }

    /// All reservations ordered by id.
    pub async fn snapshot(&self) -> Vec<Reservation> {
        self.inner.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn claim(&self) -> Result<Option<Reservation>, ReservationError> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .rows
            .values_mut()
            .find(|r| r.started_on.is_none() && r.finished_on.is_none());
        Ok(candidate.map(|row| {
            row.started_on = Some(Utc::now());
            row.clone()
        }))
    }

    async fn complete(&self, id: i64) -> Result<(), ReservationError> {
        let mut inner = self.inner.lock().await;
        let row = inner.claimed_mut(id)?;
        row.finished_on = Some(Utc::now());
        Ok(())
    }

    async fn release(&self, id: i64) -> Result<(), ReservationError> {
        let mut inner = self.inner.lock().await;
        let row = inner.claimed_mut(id)?;
        row.started_on = None;
        Ok(())
    }

    async fn split(&self, id: i64, remaining_start: u64) -> Result<i64, ReservationError> {
        let mut inner = self.inner.lock().await;
        let row = inner.claimed_mut(id)?;
        check_split(id, row.from_block, row.to_block_exclusive, remaining_start)?;
        let original_end = row.to_block_exclusive;
        row.to_block_exclusive = remaining_start;
        row.finished_on = Some(Utc::now());
        Ok(inner.insert(BlockRange::new(remaining_start, original_end)))
    }

    async fn bootstrap(
        &self,
        request: BootstrapRequest,
    ) -> Result<BootstrapReport, ReservationError> {
        let mut inner = self.inner.lock().await;
        let existing = inner.span();
        let planned = shuffled(plan_bootstrap(
            existing,
            request.start_block,
            request.end_block_inclusive,
            request.chunk_size,
        )?);
        if !request.dry_run {
            for range in &planned {
                inner.insert(*range);
            }
        }
        Ok(BootstrapReport {
            existing,
            inserted: planned,
            committed: !request.dry_run,
        })
    }

    async fn summary(&self) -> Result<ReservationSummary, ReservationError> {
        let inner = self.inner.lock().await;
        let mut summary = ReservationSummary::default();
        for row in inner.rows.values() {
            summary.total_blocks += row.len();
            if row.is_finished() {
                summary.finished += 1;
                summary.finished_blocks += row.len();
            } else if row.is_claimed() {
                summary.in_progress += 1;
            } else {
                summary.unclaimed += 1;
            }
        }
        Ok(summary)
    }
}
