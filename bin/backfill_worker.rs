//! # Backfill Worker
//!
//! Command-line entry point for the distributed backfill.
//!
//! ## Usage
//!
//! ```bash
//! # partition the configured range (safe to re-run; --dry-run only reports)
//! cargo run --bin backfill_worker -- bootstrap --dry-run
//! cargo run --bin backfill_worker -- bootstrap
//!
//! # run one worker until the range is exhausted
//! cargo run --bin backfill_worker -- --worker-name worker-1 run
//!
//! # progress, and stopping a worker from the outside
//! cargo run --bin backfill_worker -- status
//! cargo run --bin backfill_worker -- --worker-name worker-1 cancel
//! cargo run --bin backfill_worker -- --worker-name worker-1 cancel --clear
//! ```

use anyhow::Result;
use arb_backfill::{
    cancellation::{self, CancellationSignal, CancellationToken},
    chain::{RpcLogSource, TransferLogSource},
    database,
    decode::EventTable,
    detector::TransferCycleDetector,
    persistence::PgArbitrageStore,
    pipeline::BatchPipeline,
    reservations::{BootstrapRequest, PgReservationStore, ReservationStore},
    settings::Settings,
    telemetry,
    throttle::BlockThrottle,
    worker::{Worker, WorkerConfig, WorkerExit},
};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "backfill_worker", about = "Distributed ERC-20 transfer backfill")]
struct Cli {
    /// Settings file; missing files fall back to defaults and environment.
    #[arg(long, default_value = "Config.toml")]
    config: PathBuf,

    /// Overrides job.worker_name.
    #[arg(long, global = true)]
    worker_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim and process reservations until none are left.
    Run,
    /// Partition the configured range into reservations.
    Bootstrap {
        /// Report the chunks that would be inserted without committing them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print reservation counts as JSON.
    Status,
    /// Ask a worker to stop after its current window. Needs `--worker-name`.
    Cancel {
        /// Clear a previously set flag instead.
        #[arg(long)]
        clear: bool,
    },
}

/// `cancel` targets another process, so its own default name would be wrong.
fn check_worker_name(cli: &Cli) -> Result<(), clap::Error> {
    if matches!(cli.command, Command::Cancel { .. }) && cli.worker_name.is_none() {
        return Err(Cli::command().error(
            ErrorKind::MissingRequiredArgument,
            "cancel requires --worker-name <NAME>",
        ));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    if let Err(e) = check_worker_name(&cli) {
        e.exit();
    }
    let mut settings = Settings::from_path(&cli.config)?;
    if let Some(name) = cli.worker_name {
        settings.job.worker_name = name;
    }
    telemetry::init_logging(&settings.log);

    match cli.command {
        Command::Run => run(settings).await,
        Command::Bootstrap { dry_run } => bootstrap(settings, dry_run).await,
        Command::Status => status(settings).await,
        Command::Cancel { clear } => cancel(settings, clear).await,
    }
}

async fn run(settings: Settings) -> Result<()> {
    #[cfg(feature = "observability")]
    arb_backfill::metrics::install_exporter(&settings.metrics.listen_address)?;

    let events = Arc::new(EventTable::erc20()?);
    let source = Arc::new(RpcLogSource::new(&settings.rpc, events.transfer_topic())?);
    if !source.is_connected().await {
        log::error!("RPC endpoint {} is not reachable", settings.rpc.http_url);
        std::process::exit(1);
    }

    let pool = database::connect(&settings.database).await?;
    let job = settings.job.name.clone();
    let worker_name = settings.job.worker_name.clone();

    let token = CancellationToken::new();
    token.set(cancellation::read_flag(&pool, &job, &worker_name).await?);
    if token.cancel_requested() {
        log::warn!(
            "Worker {} is flagged as cancelled; clear it with `cancel --clear`",
            worker_name
        );
        return Ok(());
    }
    let poller = cancellation::spawn_poller(
        pool.clone(),
        job,
        worker_name.clone(),
        token.clone(),
        Duration::from_secs(settings.worker.cancellation_poll_seconds.max(1)),
    );
    let ctrl_c = cancellation::cancel_on_ctrl_c(token.clone());

    let pipeline = BatchPipeline::new(
        events,
        Arc::new(TransferCycleDetector::default()),
        Arc::new(PgArbitrageStore::new(pool.clone())),
        settings.pipeline.min_transfers,
    );
    let mut worker = Worker::new(
        worker_name.clone(),
        Arc::new(PgReservationStore::new(pool.clone())),
        source,
        pipeline,
        Arc::new(token),
        BlockThrottle::from_settings(&settings.throttle),
        WorkerConfig::from_settings(&settings),
    );

    let result = worker.run().await;
    poller.abort();
    ctrl_c.abort();

    let report = result.map_err(|e| {
        log::error!("Worker {} stopped: {}", worker_name, e);
        e
    })?;
    let stats = report.stats;
    match report.exit {
        WorkerExit::Done => log::info!("Worker {} finished: no work left", worker_name),
        WorkerExit::Cancelled => log::info!("Worker {} cancelled", worker_name),
    }
    log::info!(
        "Reservations: {} completed, {} split, {} released. Blocks: {}. Logs: {}. Arbitrages: {}.",
        stats.completed,
        stats.split,
        stats.released,
        stats.blocks_processed,
        stats.logs_fetched,
        stats.arbitrages
    );
    Ok(())
}

async fn bootstrap(settings: Settings, dry_run: bool) -> Result<()> {
    let (start_block, end_block_inclusive) = settings.range.bounds()?;
    let pool = database::connect(&settings.database).await?;
    let store = PgReservationStore::new(pool);

    let report = store
        .bootstrap(BootstrapRequest {
            start_block,
            end_block_inclusive,
            chunk_size: settings.range.chunk_size,
            dry_run,
        })
        .await?;

    match report.existing {
        Some(existing) => log::info!("Existing partition covers {}", existing),
        None => log::info!("No reservations yet"),
    }
    let verb = if report.committed { "Inserted" } else { "Would insert" };
    log::info!(
        "{} {} reservations covering {} blocks for [{}, {}]",
        verb,
        report.inserted.len(),
        report.inserted_blocks(),
        start_block,
        end_block_inclusive
    );
    if !report.committed && !report.inserted.is_empty() {
        log::info!("Dry run: nothing was written. Re-run without --dry-run to commit.");
    }
    Ok(())
}

async fn status(settings: Settings) -> Result<()> {
    let pool = database::connect(&settings.database).await?;
    let summary = PgReservationStore::new(pool).summary().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cancel(settings: Settings, clear: bool) -> Result<()> {
    let pool = database::connect(&settings.database).await?;
    cancellation::request_cancel(
        &pool,
        &settings.job.name,
        &settings.job.worker_name,
        !clear,
    )
    .await?;
    log::info!(
        "Cancellation flag for {}/{} set to {}",
        settings.job.name,
        settings.job.worker_name,
        !clear
    );
    Ok(())
}
