//! # Worker Loop
//!
//! ```text
//! AwaitingReservation --claim: none--> Done
//!        |
//!        | claim: reservation
//!        v
//!    Processing --(window loop)--> Completed | Cancelled{remaining_start}
//!        |
//!        v
//!    resolve: Complete | Release | Split  --> AwaitingReservation
//! ```
//!
//! Every claimed reservation is resolved before the worker looks at the next
//! one or returns, including when a window fails. A failed window is handled
//! like a cancellation at the failing window's first block: finished blocks
//! stay finished, the rest goes back to the pool.

use crate::cancellation::CancellationSignal;
use crate::chain::TransferLogSource;
use crate::error::WorkerError;
use crate::metrics;
use crate::pipeline::BatchPipeline;
use crate::progress::ProgressReporter;
use crate::reservations::{Reservation, ReservationOutcome, ReservationStore, Resolution};
use crate::settings::Settings;
use crate::throttle::BlockThrottle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub min_window: u64,
    pub max_window: u64,
    /// Reservations in a row that may end in a recoverable error before
    /// the worker gives up.
    pub max_consecutive_failures: u32,
    pub progress_period: Duration,
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_window: settings.throttle.min_window,
            max_window: settings.throttle.max_window,
            max_consecutive_failures: settings.worker.max_consecutive_failures.max(1),
            progress_period: Duration::from_secs(settings.progress.print_period_seconds),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// No unclaimed reservation left.
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub released: u64,
    pub split: u64,
    pub blocks_processed: u64,
    pub windows: u64,
    pub logs_fetched: u64,
    pub malformed_transactions: u64,
    pub arbitrages: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub exit: WorkerExit,
    pub stats: WorkerStats,
}

/// A reservation stopped by an error after `remaining_start - from_block`
/// blocks were processed.
struct Interrupted {
    remaining_start: u64,
    error: WorkerError,
}

pub struct Worker {
    name: String,
    store: Arc<dyn ReservationStore>,
    source: Arc<dyn TransferLogSource>,
    pipeline: BatchPipeline,
    cancellation: Arc<dyn CancellationSignal>,
    throttle: BlockThrottle,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ReservationStore>,
        source: Arc<dyn TransferLogSource>,
        pipeline: BatchPipeline,
        cancellation: Arc<dyn CancellationSignal>,
        throttle: BlockThrottle,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            source,
            pipeline,
            cancellation,
            throttle,
            config,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Claims and processes reservations until none are left, cancellation
    /// is requested or an error ends the run.
    pub async fn run(&mut self) -> Result<WorkerReport, WorkerError> {
        let summary = self.store.summary().await?;
        let mut progress = ProgressReporter::new(
            format!("Worker {}", self.name),
            summary.total_blocks,
            summary.finished_blocks,
            self.config.progress_period,
        );
        info!(
            worker = %self.name,
            unclaimed = summary.unclaimed,
            in_progress = summary.in_progress,
            finished = summary.finished,
            "Starting backfill worker"
        );

        let mut consecutive_failures = 0u32;
        loop {
            if self.cancellation.cancel_requested() {
                info!(worker = %self.name, "Cancellation requested, not claiming more work");
                return Ok(self.report(WorkerExit::Cancelled));
            }

            let reservation = match self.store.claim().await? {
                Some(reservation) => reservation,
                None => {
                    info!(worker = %self.name, "No unclaimed reservations left");
                    return Ok(self.report(WorkerExit::Done));
                }
            };

            let span = info_span!(
                "reservation",
                id = reservation.id,
                from = reservation.from_block,
                to = reservation.to_block_exclusive
            );
            let (outcome, failure) = match self
                .process_reservation(&reservation, &mut progress)
                .instrument(span)
                .await
            {
                Ok(outcome) => (outcome, None),
                Err(Interrupted {
                    remaining_start,
                    error,
                }) => {
                    error!(
                        id = reservation.id,
                        remaining_start,
                        "Reservation interrupted: {}",
                        error
                    );
                    (ReservationOutcome::Cancelled { remaining_start }, Some(error))
                }
            };

            let resolution = self.store.resolve(&reservation, outcome).await?;
            self.record_resolution(&reservation, outcome, resolution);

            match failure {
                Some(error) => {
                    self.stats.failures += 1;
                    consecutive_failures += 1;
                    if error.is_fatal() || consecutive_failures >= self.config.max_consecutive_failures {
                        return Err(error);
                    }
                    warn!(
                        consecutive_failures,
                        max = self.config.max_consecutive_failures,
                        "Moving on to the next reservation"
                    );
                }
                None => {
                    consecutive_failures = 0;
                    if matches!(outcome, ReservationOutcome::Cancelled { .. }) {
                        return Ok(self.report(WorkerExit::Cancelled));
                    }
                }
            }
        }
    }

    /// Walks one reservation in throttle-sized windows. The cursor only
    /// advances past a window once its results are persisted.
    async fn process_reservation(
        &mut self,
        reservation: &Reservation,
        progress: &mut ProgressReporter,
    ) -> Result<ReservationOutcome, Interrupted> {
        let end = reservation.to_block_exclusive;
        let mut cursor = reservation.from_block;

        while cursor < end {
            if self.cancellation.cancel_requested() {
                return Ok(ReservationOutcome::Cancelled {
                    remaining_start: cursor,
                });
            }

            let window = self
                .throttle
                .next_window(self.config.min_window, self.config.max_window);
            let to_inclusive = cursor.saturating_add(window - 1).min(end - 1);
            metrics::set_throttle_window(window);

            let fetch_started = Instant::now();
            let logs = match self.source.fetch_transfer_logs(cursor, to_inclusive).await {
                Ok(logs) => logs,
                Err(e) => {
                    metrics::increment_window_failures("fetch");
                    return Err(Interrupted {
                        remaining_start: cursor,
                        error: e.into(),
                    });
                }
            };
            let fetch_elapsed = fetch_started.elapsed();

            let batch = match self.pipeline.process(&logs).await {
                Ok(batch) => batch,
                Err(e) => {
                    metrics::increment_window_failures("pipeline");
                    return Err(Interrupted {
                        remaining_start: cursor,
                        error: e.into(),
                    });
                }
            };
            self.throttle.observe(logs.len());

            let blocks = to_inclusive + 1 - cursor;
            debug!(
                from = cursor,
                to = to_inclusive,
                logs = logs.len(),
                candidates = batch.candidates,
                arbitrages = batch.arbitrages,
                next_window = self.throttle.current(),
                "Window processed"
            );
            cursor = to_inclusive + 1;

            self.stats.windows += 1;
            self.stats.blocks_processed += blocks;
            self.stats.logs_fetched += logs.len() as u64;
            self.stats.malformed_transactions += batch.malformed as u64;
            self.stats.arbitrages += batch.arbitrages as u64;
            metrics::record_window(blocks, logs.len(), fetch_elapsed);
            metrics::record_batch(batch.malformed, batch.arbitrages);
            progress.observe(blocks);
        }

        Ok(ReservationOutcome::Completed)
    }

    fn record_resolution(
        &mut self,
        reservation: &Reservation,
        outcome: ReservationOutcome,
        resolution: Resolution,
    ) {
        match resolution {
            Resolution::Completed => {
                self.stats.completed += 1;
                metrics::increment_reservations("completed");
                info!(id = reservation.id, "Completed reservation {}", reservation.range());
            }
            Resolution::Released => {
                self.stats.released += 1;
                metrics::increment_reservations("released");
                info!(id = reservation.id, "Released reservation {}", reservation.range());
            }
            Resolution::Split { new_id } => {
                self.stats.split += 1;
                metrics::increment_reservations("split");
                if let ReservationOutcome::Cancelled { remaining_start } = outcome {
                    info!(
                        id = reservation.id,
                        new_id,
                        "Split reservation {}: finished [{}, {}), remainder [{}, {})",
                        reservation.range(),
                        reservation.from_block,
                        remaining_start,
                        remaining_start,
                        reservation.to_block_exclusive
                    );
                }
            }
        }
    }

    fn report(&self, exit: WorkerExit) -> WorkerReport {
        WorkerReport {
            exit,
            stats: self.stats,
        }
    }
}
