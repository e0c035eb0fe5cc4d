//! # Arb Backfill
//!
//! Distributed historical backfill of ERC-20 transfer traces into an
//! arbitrage sample store.
//!
//! ## Overview
//!
//! Many worker processes share one Postgres database. The historical block
//! range is partitioned into reservations; each worker repeatedly claims one,
//! walks it in adaptively sized `eth_getLogs` windows, assembles the transfer
//! trace of every transaction, hands traces to an arbitrage detector and
//! persists the results before moving its cursor forward.
//!
//! ## Architecture
//!
//! ### Coordination Layer
//! Reservations with exactly-once claims (`FOR UPDATE SKIP LOCKED`), crash-safe
//! resolution (complete, release, split) and idempotent bootstrap.
//!
//! ### Fetch Layer
//! An RPC log source behind a trait, sized by a feedback throttle that targets
//! a fixed number of logs per round trip.
//!
//! ### Analysis Layer
//! Per-window batch pipeline: grouping, ordering, all-or-nothing decoding,
//! detection and one persistence call per window.

// Coordination
/// Block-range reservations and their stores
pub mod reservations;
/// Worker state machine
pub mod worker;
/// Cooperative cancellation
pub mod cancellation;

// Fetch
/// Transfer log source (RPC)
pub mod chain;
/// Adaptive block window
pub mod throttle;

// Analysis
/// Event ABI lookup and transfer decoding
pub mod decode;
/// Arbitrage detection contract and reference detector
pub mod detector;
/// Per-window transaction assembly
pub mod pipeline;
/// Arbitrage persistence
pub mod persistence;

// Infrastructure
/// PostgreSQL connection and schema
pub mod database;
/// Error types
pub mod error;
/// Metrics and observability
pub mod metrics;
/// Progress reporting with ETA
pub mod progress;
/// Logger installation
pub mod telemetry;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use reservations::{PgReservationStore, ReservationStore};
pub use settings::Settings;
pub use worker::{Worker, WorkerConfig, WorkerExit};
