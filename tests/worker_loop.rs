//! Worker loop against the in-memory reservation store and a scripted log source.

mod support;

use arb_backfill::cancellation::CancellationToken;
use arb_backfill::decode::EventTable;
use arb_backfill::error::{PipelineError, WorkerError};
use arb_backfill::reservations::{BlockRange, InMemoryReservationStore, Reservation};
use arb_backfill::worker::{Worker, WorkerExit};
use ethers::types::{H256, U256};
use std::sync::Arc;
use support::*;

fn ranges(rows: &[Reservation]) -> Vec<(u64, u64, bool, bool)> {
    let mut out: Vec<_> = rows
        .iter()
        .map(|r| {
            (
                r.from_block,
                r.to_block_exclusive,
                r.started_on.is_some(),
                r.finished_on.is_some(),
            )
        })
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn test_runs_until_no_reservations_left() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let mut logs = triangle_arbitrage(&events, 0xa1, 120);
    logs.extend(plain_transfer(&events, 0xb1, 121));
    logs.extend(triangle_arbitrage(&events, 0xa2, 275));

    let store = Arc::new(InMemoryReservationStore::from_ranges(&[
        BlockRange::new(100, 200),
        BlockRange::new(200, 300),
    ]));
    let source = Arc::new(ScriptedLogSource::new(logs));
    let sink = Arc::new(RecordingSink::default());

    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        source.clone(),
        pipeline(events, sink.clone()),
        Arc::new(CancellationToken::new()),
        fixed_throttle(30),
        worker_config(30, 1),
    );
    let report = worker.run().await.unwrap();

    assert_eq!(report.exit, WorkerExit::Done);
    assert_eq!(report.stats.completed, 2);
    assert_eq!(report.stats.blocks_processed, 200);
    assert_eq!(report.stats.arbitrages, 2);

    let rows = store.snapshot().await;
    assert!(rows.iter().all(|r| r.is_finished()));
    assert_eq!(
        ranges(&rows),
        vec![(100, 200, true, true), (200, 300, true, true)]
    );

    // windows never cross the reservation end and cover every block once
    let mut requests = source.requests();
    requests.sort();
    let mut expected_next = 100;
    for (from, to) in &requests {
        assert_eq!(*from, expected_next);
        assert!(to - from < 30);
        expected_next = to + 1;
    }
    assert_eq!(expected_next, 300);
    assert!(requests.iter().any(|(_, to)| *to == 199));

    let found = sink.arbitrages();
    let mut hashes: Vec<H256> = found.iter().map(|a| a.tx_hash).collect();
    hashes.sort();
    assert_eq!(
        hashes,
        vec![H256::from_low_u64_be(0xa1), H256::from_low_u64_be(0xa2)]
    );
    assert!(found.iter().all(|a| a.profit_amount == U256::from(50u64)));
    // one persistence call per processed window
    assert_eq!(sink.calls(), requests.len());
}

#[tokio::test]
async fn test_cancellation_mid_reservation_splits() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let token = CancellationToken::new();
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[BlockRange::new(
        100, 200,
    )]));
    let source = Arc::new(ScriptedLogSource::new(Vec::new()).cancel_after(1, token.clone()));

    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        source,
        pipeline(events, Arc::new(RecordingSink::default())),
        Arc::new(token),
        fixed_throttle(50),
        worker_config(50, 1),
    );
    let report = worker.run().await.unwrap();

    assert_eq!(report.exit, WorkerExit::Cancelled);
    assert_eq!(report.stats.split, 1);
    assert_eq!(
        ranges(&store.snapshot().await),
        vec![(100, 150, true, true), (150, 200, false, false)]
    );
}

#[tokio::test]
async fn test_cancellation_before_first_window_releases() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[BlockRange::new(
        100, 200,
    )]));
    let source = Arc::new(ScriptedLogSource::new(Vec::new()));

    // the outer check lets the claim through, the first window check cancels
    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        source.clone(),
        pipeline(events, Arc::new(RecordingSink::default())),
        Arc::new(CancelAfterChecks::new(1)),
        fixed_throttle(50),
        worker_config(50, 1),
    );
    let report = worker.run().await.unwrap();

    assert_eq!(report.exit, WorkerExit::Cancelled);
    assert_eq!(report.stats.released, 1);
    assert!(source.requests().is_empty());

    let rows = store.snapshot().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(ranges(&rows), vec![(100, 200, false, false)]);
}

#[tokio::test]
async fn test_cancelled_worker_claims_nothing() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let token = CancellationToken::new();
    token.cancel();
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[BlockRange::new(
        0, 10,
    )]));

    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        Arc::new(ScriptedLogSource::new(Vec::new())),
        pipeline(events, Arc::new(RecordingSink::default())),
        Arc::new(token),
        fixed_throttle(5),
        worker_config(5, 1),
    );
    let report = worker.run().await.unwrap();

    assert_eq!(report.exit, WorkerExit::Cancelled);
    assert_eq!(ranges(&store.snapshot().await), vec![(0, 10, false, false)]);
}

#[tokio::test]
async fn test_fetch_error_splits_then_fails() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[BlockRange::new(
        100, 200,
    )]));
    let source = Arc::new(ScriptedLogSource::new(Vec::new()).failing_on(150..160));

    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        source,
        pipeline(events, Arc::new(RecordingSink::default())),
        Arc::new(CancellationToken::new()),
        fixed_throttle(50),
        worker_config(50, 1),
    );
    let err = worker.run().await.unwrap_err();

    assert!(matches!(err, WorkerError::Fetch(_)));
    assert!(!err.is_fatal());
    assert_eq!(worker.stats().split, 1);
    assert_eq!(
        ranges(&store.snapshot().await),
        vec![(100, 150, true, true), (150, 200, false, false)]
    );
}

#[tokio::test]
async fn test_persist_failure_splits_at_unpersisted_window() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[BlockRange::new(
        100, 200,
    )]));
    // the arbitrage sits in the second window, whose persist fails
    let source = Arc::new(ScriptedLogSource::new(triangle_arbitrage(&events, 0xa1, 140)));
    let sink = Arc::new(RecordingSink::failing_on_call(2));

    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        source,
        pipeline(events.clone(), sink.clone()),
        Arc::new(CancellationToken::new()),
        fixed_throttle(30),
        worker_config(30, 1),
    );
    let err = worker.run().await.unwrap_err();

    assert!(matches!(err, WorkerError::Pipeline(PipelineError::Persist(_))));
    assert!(!err.is_fatal());
    assert_eq!(worker.stats().split, 1);
    assert_eq!(worker.stats().blocks_processed, 30);
    assert_eq!(sink.calls(), 1);
    assert!(sink.arbitrages().is_empty());
    assert_eq!(
        ranges(&store.snapshot().await),
        vec![(100, 130, true, true), (130, 200, false, false)]
    );

    // the unpersisted window is picked up again from its first block
    let retry_source = Arc::new(ScriptedLogSource::new(triangle_arbitrage(&events, 0xa1, 140)));
    let retry_sink = Arc::new(RecordingSink::default());
    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        retry_source.clone(),
        pipeline(events, retry_sink.clone()),
        Arc::new(CancellationToken::new()),
        fixed_throttle(30),
        worker_config(30, 1),
    );
    assert_eq!(worker.run().await.unwrap().exit, WorkerExit::Done);
    assert_eq!(retry_source.requests().first(), Some(&(130, 159)));
    let found: Vec<H256> = retry_sink.arbitrages().iter().map(|a| a.tx_hash).collect();
    assert_eq!(found, vec![H256::from_low_u64_be(0xa1)]);
}

#[tokio::test]
async fn test_duplicated_logs_are_fatal_despite_budget() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let mut logs = triangle_arbitrage(&events, 0xa1, 120);
    logs.push(logs[2].clone());

    let store = Arc::new(InMemoryReservationStore::from_ranges(&[
        BlockRange::new(100, 200),
        BlockRange::new(200, 300),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        Arc::new(ScriptedLogSource::new(logs)),
        pipeline(events, sink.clone()),
        Arc::new(CancellationToken::new()),
        fixed_throttle(30),
        worker_config(30, 5),
    );
    let err = worker.run().await.unwrap_err();

    assert!(matches!(
        err,
        WorkerError::Pipeline(PipelineError::DuplicateTransaction(hash))
            if hash == H256::from_low_u64_be(0xa1)
    ));
    assert!(err.is_fatal());
    assert_eq!(worker.stats().released, 1);
    assert_eq!(sink.calls(), 0);
    assert_eq!(
        ranges(&store.snapshot().await),
        vec![(100, 200, false, false), (200, 300, false, false)]
    );
}

#[tokio::test]
async fn test_failure_budget_moves_on_then_gives_up() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[
        BlockRange::new(0, 100),
        BlockRange::new(100, 200),
    ]));
    let source = Arc::new(ScriptedLogSource::new(Vec::new()).failing_on(150..160));

    let mut worker = Worker::new(
        "test-worker",
        store.clone(),
        source,
        pipeline(events, Arc::new(RecordingSink::default())),
        Arc::new(CancellationToken::new()),
        fixed_throttle(50),
        worker_config(50, 3),
    );
    let err = worker.run().await.unwrap_err();
    assert!(matches!(err, WorkerError::Fetch(_)));

    let stats = worker.stats();
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.split, 1);
    assert_eq!(stats.released, 2);

    // nothing lost: the failing tail is back in the pool
    assert_eq!(
        ranges(&store.snapshot().await),
        vec![
            (0, 100, true, true),
            (100, 150, true, true),
            (150, 200, false, false)
        ]
    );
}

#[tokio::test]
async fn test_resumes_from_split_remainder() {
    let events = Arc::new(EventTable::erc20().unwrap());
    let token = CancellationToken::new();
    let store = Arc::new(InMemoryReservationStore::from_ranges(&[BlockRange::new(
        0, 100,
    )]));

    let first = Arc::new(ScriptedLogSource::new(Vec::new()).cancel_after(2, token.clone()));
    let mut worker = Worker::new(
        "first",
        store.clone(),
        first,
        pipeline(events.clone(), Arc::new(RecordingSink::default())),
        Arc::new(token),
        fixed_throttle(20),
        worker_config(20, 1),
    );
    assert_eq!(worker.run().await.unwrap().exit, WorkerExit::Cancelled);

    let second = Arc::new(ScriptedLogSource::new(Vec::new()));
    let mut worker = Worker::new(
        "second",
        store.clone(),
        second.clone(),
        pipeline(events, Arc::new(RecordingSink::default())),
        Arc::new(CancellationToken::new()),
        fixed_throttle(20),
        worker_config(20, 1),
    );
    let report = worker.run().await.unwrap();
    assert_eq!(report.exit, WorkerExit::Done);
    assert_eq!(report.stats.blocks_processed, 60);
    assert_eq!(second.requests().first(), Some(&(40, 59)));
    assert_eq!(
        ranges(&store.snapshot().await),
        vec![(0, 40, true, true), (40, 100, true, true)]
    );
}
