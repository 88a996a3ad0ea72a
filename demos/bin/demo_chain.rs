//! Chain Demo
//!
//! Sends an attachment the way a messenger would: two compression jobs run in
//! parallel, an upload waits for both, and the message send waits for the
//! upload. Network-bound stages hold until the network comes back.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use relay_jobs::{EngineConfig, FlagConstraint, JobManager, JobState, Parameters, StoreConfig};

use relay_demos::jobs::SimulatedStep;
use relay_demos::{
    init_logging, print_header, print_info, print_outcome, print_result, print_section, track,
};

const NETWORK: &str = "NetworkAvailable";

#[derive(Parser, Debug)]
#[command(name = "demo-chain")]
#[command(about = "Run a compress → upload → send chain")]
struct Args {
    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory (defaults to a temporary directory)
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Time the network stays down after the chain is enqueued
    #[arg(long, default_value = "500")]
    offline_ms: u64,

    /// Make the second compression fail permanently
    #[arg(long)]
    fail_compress: bool,

    /// Probability of a transient upload failure per attempt
    #[arg(long, default_value = "0.3")]
    failure_rate: f64,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = EngineConfig::load(args.config.as_deref()).context("loading config")?;
    init_logging(args.verbose, &config.logging);
    let store_dir = args.store_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("relay-demo-chain-{}", std::process::id()))
    });
    config.store = StoreConfig::sqlite(&store_dir);

    print_header("Relay Chain Demo");
    print_result("Store", store_dir.display());
    print_result("Workers", config.max_workers);

    let network = FlagConstraint::new(false);
    let manager = JobManager::builder(config)
        .factory(SimulatedStep::FACTORY_KEY, SimulatedStep::factory)
        .constraint(NETWORK, network.clone())
        .start()
        .await?;

    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match (&event.state, &event.reason) {
                (JobState::FailedPermanent, Some(reason)) => {
                    print_info(&format!("{} {}: {}", event.job_id, event.state, reason));
                }
                _ => print_info(&format!("{} {}", event.job_id, event.state)),
            }
        }
    });

    print_section("Enqueue");
    let compress_b = SimulatedStep::new("compress-b").with_work(150);
    let compress_b = if args.fail_compress {
        compress_b.always_fatal()
    } else {
        compress_b
    };
    let network_bound = || {
        Parameters::new()
            .add_constraint(NETWORK)
            .max_attempts(10)
            .lifespan(Duration::from_secs(60))
    };

    let start = Instant::now();
    let ids = manager
        .start_chain(vec![
            SimulatedStep::new("compress-a").with_work(200).shared(),
            compress_b.shared(),
        ])
        .then(vec![SimulatedStep::new("upload")
            .with_work(300)
            .with_failure_rate(args.failure_rate)
            .with_parameters(network_bound())
            .shared()])
        .then(vec![SimulatedStep::new("send")
            .with_work(100)
            .with_parameters(network_bound().queue("conversation-1"))
            .shared()])
        .enqueue();
    print_result("Jobs", ids.len());
    print_info(&format!("Network is down for {} ms", args.offline_ms));

    let flip = network.clone();
    let offline = Duration::from_millis(args.offline_ms);
    tokio::spawn(async move {
        tokio::time::sleep(offline).await;
        flip.set(true);
        print_info("Network is back");
    });

    print_section("Run");
    let outcome = track(&manager, &ids, Duration::from_secs(60), !args.no_progress).await;
    print_result("Elapsed", format!("{:.2?}", start.elapsed()));

    manager.shutdown().await;
    printer.abort();

    print_section("Summary");
    print_outcome(&outcome);
    Ok(())
}
