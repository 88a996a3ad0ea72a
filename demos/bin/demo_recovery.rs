//! Recovery Demo
//!
//! Shows that enqueued work survives a restart. Run `enqueue` to persist a
//! batch of jobs while the network is down and exit, then `resume` in a new
//! process to pick them up and finish them.
//!
//! ```text
//! demo-recovery --store-dir /tmp/relay enqueue --count 5
//! demo-recovery --store-dir /tmp/relay status
//! demo-recovery --store-dir /tmp/relay resume
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_jobs::{EngineConfig, FlagConstraint, JobManager, JobStore, Parameters, StoreConfig};

use relay_demos::jobs::SimulatedStep;
use relay_demos::{
    init_logging, print_header, print_info, print_outcome, print_result, print_section,
    print_success, track,
};

const NETWORK: &str = "NetworkAvailable";

#[derive(Parser, Debug)]
#[command(name = "demo-recovery")]
#[command(about = "Persist jobs, restart, and resume them")]
struct Args {
    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Store directory shared between runs
    #[arg(long, env = "RELAY_STORE_PATH")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue jobs while offline, then exit without running them
    Enqueue {
        /// Number of jobs
        #[arg(long, default_value = "5")]
        count: usize,

        /// Queue key shared by the jobs
        #[arg(long, default_value = "outbox")]
        queue: String,
    },

    /// Restart the engine with the network up and finish persisted jobs
    Resume {
        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// List persisted jobs without starting the engine
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = EngineConfig::load(None).context("loading config")?;
    init_logging(args.verbose, &config.logging);
    config.store = StoreConfig::sqlite(&args.store_dir);

    match args.command {
        Commands::Enqueue { count, queue } => enqueue(config, count, &queue).await,
        Commands::Resume { no_progress } => resume(config, !no_progress).await,
        Commands::Status => status(&config.store).await,
    }
}

async fn enqueue(config: EngineConfig, count: usize, queue: &str) -> anyhow::Result<()> {
    print_header("Relay Recovery Demo: Enqueue");

    let network = FlagConstraint::new(false);
    let manager = JobManager::builder(config)
        .factory(SimulatedStep::FACTORY_KEY, SimulatedStep::factory)
        .constraint(NETWORK, network)
        .start()
        .await?;

    for i in 0..count {
        let step = SimulatedStep::new(format!("message-{i}"))
            .with_work(100)
            .with_parameters(
                Parameters::new()
                    .queue(queue)
                    .add_constraint(NETWORK)
                    .unlimited_attempts(),
            );
        let id = manager.add(step);
        print_result("Enqueued", id);
    }

    manager.flush().await;
    let stats = manager.stats().await;
    manager.shutdown().await;

    print_result("Pending", stats.pending);
    print_success("Jobs persisted; run `resume` to finish them");
    Ok(())
}

async fn resume(config: EngineConfig, show_progress: bool) -> anyhow::Result<()> {
    print_header("Relay Recovery Demo: Resume");

    let store = config.store.open().await?;
    let ids: Vec<_> = store
        .load_all_pending()
        .await?
        .into_iter()
        .map(|record| record.id)
        .collect();
    print_result("Recovered", ids.len());
    if ids.is_empty() {
        print_info("Nothing to resume; run `enqueue` first");
        return Ok(());
    }

    let network = FlagConstraint::new(true);
    let manager = JobManager::builder(config)
        .factory(SimulatedStep::FACTORY_KEY, SimulatedStep::factory)
        .constraint(NETWORK, network)
        .store(store)
        .start()
        .await?;

    print_section("Run");
    let outcome = track(&manager, &ids, Duration::from_secs(60), show_progress).await;
    manager.shutdown().await;

    print_section("Summary");
    print_outcome(&outcome);
    Ok(())
}

async fn status(store: &StoreConfig) -> anyhow::Result<()> {
    print_header("Relay Recovery Demo: Status");

    let store = store.open().await?;
    let records = store.load_all_pending().await?;
    print_result("Persisted jobs", records.len());

    for record in &records {
        println!(
            "  {} {} queue={} attempts={}",
            record.id,
            record.factory_key,
            record.queue_key.as_deref().unwrap_or("-"),
            record.attempt_count,
        );
    }
    Ok(())
}
