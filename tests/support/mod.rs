//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use arb_backfill::cancellation::{CancellationSignal, CancellationToken};
use arb_backfill::chain::TransferLogSource;
use arb_backfill::decode::EventTable;
use arb_backfill::detector::{Arbitrage, TransferCycleDetector};
use arb_backfill::error::{FetchError, PersistError};
use arb_backfill::persistence::ArbitrageSink;
use arb_backfill::pipeline::BatchPipeline;
use arb_backfill::throttle::BlockThrottle;
use arb_backfill::worker::WorkerConfig;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn transfer_log(
    events: &EventTable,
    tx: u64,
    block: u64,
    index: u64,
    token: u64,
    from: u64,
    to: u64,
    value: u64,
) -> Log {
    let mut data = [0u8; 32];
    U256::from(value).to_big_endian(&mut data);
    Log {
        address: addr(token),
        topics: vec![
            events.transfer_topic(),
            H256::from(addr(from)),
            H256::from(addr(to)),
        ],
        data: Bytes::from(data.to_vec()),
        block_number: Some(U64::from(block)),
        transaction_hash: Some(H256::from_low_u64_be(tx)),
        log_index: Some(U256::from(index)),
        ..Default::default()
    }
}

/// Trader 1 swaps token 10 -> 11 -> 12 -> 10 through pools 2, 3, 4 and ends
/// up with 50 more units of token 10.
pub fn triangle_arbitrage(events: &EventTable, tx: u64, block: u64) -> Vec<Log> {
    vec![
        transfer_log(events, tx, block, 0, 10, 1, 2, 1_000),
        transfer_log(events, tx, block, 1, 11, 2, 3, 5_000),
        transfer_log(events, tx, block, 2, 12, 3, 4, 5_000),
        transfer_log(events, tx, block, 3, 10, 4, 1, 1_050),
    ]
}

/// Plain two-transfer transaction, never a candidate.
pub fn plain_transfer(events: &EventTable, tx: u64, block: u64) -> Vec<Log> {
    vec![
        transfer_log(events, tx, block, 0, 10, 5, 6, 1),
        transfer_log(events, tx, block, 1, 10, 6, 7, 1),
    ]
}

/// Serves a fixed set of logs by block range and records every request.
#[derive(Default)]
pub struct ScriptedLogSource {
    logs: Vec<Log>,
    failing_blocks: Option<Range<u64>>,
    cancel_after: Option<(usize, CancellationToken)>,
    requests: Mutex<Vec<(u64, u64)>>,
}

impl ScriptedLogSource {
    pub fn new(logs: Vec<Log>) -> Self {
        Self {
            logs,
            ..Default::default()
        }
    }

    /// Requests touching any of `blocks` fail.
    pub fn failing_on(mut self, blocks: Range<u64>) -> Self {
        self.failing_blocks = Some(blocks);
        self
    }

    /// Trips `token` once `fetches` requests have been served.
    pub fn cancel_after(mut self, fetches: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((fetches, token));
        self
    }

    pub fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferLogSource for ScriptedLogSource {
    async fn fetch_transfer_logs(
        &self,
        from_block: u64,
        to_block_inclusive: u64,
    ) -> Result<Vec<Log>, FetchError> {
        if let Some(failing) = &self.failing_blocks {
            if from_block < failing.end && failing.start <= to_block_inclusive {
                return Err(FetchError::Other(format!(
                    "scripted failure for [{}, {}]",
                    from_block, to_block_inclusive
                )));
            }
        }

        let served = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((from_block, to_block_inclusive));
            requests.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if served >= *after {
                token.cancel();
            }
        }

        Ok(self
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
                from_block <= block && block <= to_block_inclusive
            })
            .cloned()
            .collect())
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<Arbitrage>>>,
    attempts: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl RecordingSink {
    /// The `call`-th persist (1-based) fails and stores nothing.
    pub fn failing_on_call(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Default::default()
        }
    }

    pub fn arbitrages(&self) -> Vec<Arbitrage> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl ArbitrageSink for RecordingSink {
    async fn persist(&self, arbitrages: &[Arbitrage]) -> Result<usize, PersistError> {
        let call = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(PersistError::Other("scripted persist failure".into()));
        }
        self.batches.lock().unwrap().push(arbitrages.to_vec());
        Ok(arbitrages.len())
    }
}

/// Reports "not cancelled" for the first `checks` polls, then "cancelled".
pub struct CancelAfterChecks {
    checks: usize,
    polled: AtomicUsize,
}

impl CancelAfterChecks {
    pub fn new(checks: usize) -> Self {
        Self {
            checks,
            polled: AtomicUsize::new(0),
        }
    }
}

impl CancellationSignal for CancelAfterChecks {
    fn cancel_requested(&self) -> bool {
        self.polled.fetch_add(1, Ordering::SeqCst) >= self.checks
    }
}

pub fn pipeline(events: Arc<EventTable>, sink: Arc<RecordingSink>) -> BatchPipeline {
    BatchPipeline::new(events, Arc::new(TransferCycleDetector::default()), sink, 3)
}

/// Throttle that always asks for exactly `window` blocks.
pub fn fixed_throttle(window: u64) -> BlockThrottle {
    BlockThrottle::new(1_000_000.0, 0.0, window as f64)
}

pub fn worker_config(max_window: u64, max_consecutive_failures: u32) -> WorkerConfig {
    WorkerConfig {
        min_window: 1,
        max_window,
        max_consecutive_failures,
        progress_period: Duration::from_secs(3_600),
    }
}
