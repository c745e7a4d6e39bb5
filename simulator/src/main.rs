//! Tallybank Simulator
//!
//! Load generator for the ledger: opens customer accounts and hammers them
//! with concurrent transfers, then checks that no money was created or lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tallybank_common::Context;
use tallybank_ledger::{Ledger, LedgerConfig, MemoryStore, PgStore};
use tallybank_worker::{
    task_queue, verify_email_options, ProcessorConfig, SendVerifyEmailHandler, TaskDistributor,
    TaskProcessor, TASK_SEND_VERIFY_EMAIL,
};

mod controller;
mod customer;
mod metrics;
mod scenario;

use controller::{SimulationConfig, SimulationController};
use customer::CustomerFactory;
use scenario::Workload;

/// Tallybank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Tallybank ledger load generator")]
struct Args {
    /// Number of customers (one account each)
    #[arg(short, long, default_value = "10")]
    customers: usize,

    /// Workload to run: ping-pong, fan-in, random, overdraft
    #[arg(short, long, default_value = "ping-pong")]
    workload: String,

    /// Concurrent transfer workers
    #[arg(long, default_value = "8")]
    workers: usize,

    /// Transfers per worker
    #[arg(long, default_value = "100")]
    transfers: usize,

    /// Opening balance of every account, in minor units
    #[arg(long, default_value = "100000")]
    initial_balance: i64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// PostgreSQL URL; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Artificial row-lock hold time of the in-memory store, in milliseconds
    #[arg(long, default_value = "0")]
    row_latency_ms: u64,

    /// Delay before verification e-mails are processed, in milliseconds
    #[arg(long, default_value = "100")]
    verify_delay_ms: u64,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn open_ledger(args: &Args) -> anyhow::Result<Arc<dyn Ledger>> {
    let mut config = LedgerConfig::from_env();
    config.database_url = args.database_url.clone();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    if config.database_url.is_some() {
        info!("Using PostgreSQL store");
        return Ok(Arc::new(PgStore::connect(&config).await?));
    }

    info!("Using in-memory store");
    let mut store = MemoryStore::in_memory();
    if let Some(timeout) = config.transaction_timeout {
        store = store.with_transaction_timeout(timeout);
    }
    if args.row_latency_ms > 0 {
        store
            .backend()
            .faults()
            .set_row_latency(Duration::from_millis(args.row_latency_ms));
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Tallybank Simulator");
    let workload = Workload::load(&args.workload)?;
    let ledger = open_ledger(&args).await?;

    // Set up graceful shutdown
    let ctx = Context::background().with_cancel();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    // Start background task processor
    let (distributor, receiver) = task_queue(1024);
    let processor = TaskProcessor::new(receiver, ProcessorConfig::default()).register(
        TASK_SEND_VERIFY_EMAIL,
        Arc::new(SendVerifyEmailHandler::new(ledger.clone())),
    );
    let task_stats = processor.stats();
    let processor_handle = tokio::spawn(processor.run(ctx.clone()));

    let distributor: Arc<dyn TaskDistributor> = Arc::new(distributor);
    let factory = CustomerFactory::new(
        ledger.clone(),
        distributor,
        verify_email_options().process_in(Duration::from_millis(args.verify_delay_ms)),
    );

    let mut controller = SimulationController::new(
        ledger.clone(),
        SimulationConfig {
            workers: args.workers,
            transfers_per_worker: args.transfers,
            initial_balance: args.initial_balance,
            seed: args.seed,
        },
    );

    let run_id = format!("{:x}", rand::random::<u32>());
    controller
        .initialize(&ctx, &factory, &run_id, args.customers)
        .await?;
    // The processor stops once the queue drains.
    drop(factory);

    let started = Instant::now();
    controller.run(&ctx, workload).await?;
    let elapsed = started.elapsed();

    let conservation = controller
        .verify_conservation(&Context::background())
        .await?;

    if let Err(e) = processor_handle.await {
        warn!(error = %e, "Task processor ended abnormally");
    }
    ledger.close().await;

    // Print metrics
    let metrics = controller.metrics();
    let report = metrics.report();
    info!("Simulation complete");
    info!("Total transfers: {}", report.total_transfers);
    info!("Successful: {}", report.successful_transfers);
    info!("Failed: {}", report.failed_transfers);
    for (code, count) in &report.failures {
        info!("  {}: {}", code, count);
    }
    info!("Success rate: {:.2}%", metrics.success_rate() * 100.0);
    info!("Throughput: {:.1} transfers/s", metrics.throughput(elapsed.as_secs_f64()));
    info!(
        "Latency avg/p50/p99: {}/{}/{} µs",
        report.average_latency_us, report.p50_latency_us, report.p99_latency_us
    );
    info!("Verification e-mails: {:?}", task_stats.snapshot());

    if !conservation.holds() {
        return Err(anyhow::anyhow!(
            "Money not conserved: expected {}, found {}, negative accounts {:?}",
            conservation.expected_total,
            conservation.actual_total,
            conservation.negative_accounts
        ));
    }

    Ok(())
}
