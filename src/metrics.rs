//! Backfill metrics. With `observability` off, the macros below expand to
//! nothing and the helpers compile to no-ops.

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

use std::time::Duration;

/// Registers descriptions for every backfill metric. Call once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "backfill_reservations_total",
        Unit::Count,
        "Reservations resolved by this worker, labeled by resolution (completed, released, split)."
    );
    describe_counter!(
        "backfill_blocks_processed_total",
        Unit::Count,
        "Blocks whose logs were fetched, analysed and persisted."
    );
    describe_counter!(
        "backfill_logs_fetched_total",
        Unit::Count,
        "Transfer logs returned by eth_getLogs."
    );
    describe_counter!(
        "backfill_malformed_transactions_total",
        Unit::Count,
        "Transactions dropped because one of their logs failed to decode."
    );
    describe_counter!(
        "backfill_arbitrages_total",
        Unit::Count,
        "Arbitrages detected."
    );
    describe_counter!(
        "backfill_window_failures_total",
        Unit::Count,
        "Block windows that failed, labeled by stage (fetch, pipeline)."
    );
    describe_gauge!(
        "backfill_throttle_window_blocks",
        "Block window the throttle chose for the last fetch."
    );
    describe_histogram!(
        "backfill_fetch_seconds",
        Unit::Seconds,
        "eth_getLogs latency per block window."
    );
}

/// Serves `/metrics` on `listen_address`. Needs a running tokio runtime.
#[cfg(feature = "observability")]
pub fn install_exporter(listen_address: &str) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = listen_address.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    log::info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg_attr(not(feature = "observability"), allow(unused_variables))]
pub fn increment_reservations(resolution: &'static str) {
    increment_counter!("backfill_reservations_total", "resolution" => resolution);
}

#[cfg_attr(not(feature = "observability"), allow(unused_variables))]
pub fn record_window(blocks: u64, logs: usize, fetch: Duration) {
    counter!("backfill_blocks_processed_total", blocks);
    counter!("backfill_logs_fetched_total", logs as u64);
    histogram!("backfill_fetch_seconds", fetch.as_secs_f64());
}

#[cfg_attr(not(feature = "observability"), allow(unused_variables))]
pub fn record_batch(malformed: usize, arbitrages: usize) {
    counter!("backfill_malformed_transactions_total", malformed as u64);
    counter!("backfill_arbitrages_total", arbitrages as u64);
}

#[cfg_attr(not(feature = "observability"), allow(unused_variables))]
pub fn increment_window_failures(stage: &'static str) {
    increment_counter!("backfill_window_failures_total", "stage" => stage);
}

#[cfg_attr(not(feature = "observability"), allow(unused_variables))]
pub fn set_throttle_window(blocks: u64) {
    gauge!("backfill_throttle_window_blocks", blocks as f64);
}
