//! Queue Demo
//!
//! Enqueues messages for several conversations. Each conversation has its own
//! queue, so its messages go out strictly in order while different
//! conversations proceed in parallel.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use relay_jobs::{EngineConfig, JobId, JobManager, JobState, Parameters, StoreConfig};
use tokio::sync::broadcast::error::RecvError;

use relay_demos::jobs::SimulatedStep;
use relay_demos::{
    init_logging, print_failure, print_header, print_outcome, print_result, print_section,
    print_success, track,
};

#[derive(Parser, Debug)]
#[command(name = "demo-queue")]
#[command(about = "Send messages through per-conversation queues")]
struct Args {
    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of conversations
    #[arg(long, default_value = "3")]
    conversations: usize,

    /// Messages per conversation
    #[arg(long, default_value = "5")]
    messages: usize,

    /// Probability of a transient send failure per attempt
    #[arg(long, default_value = "0.2")]
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
    config.store = StoreConfig::sqlite(
        std::env::temp_dir().join(format!("relay-demo-queue-{}", std::process::id())),
    );

    print_header("Relay Queue Demo");
    print_result("Conversations", args.conversations);
    print_result("Messages each", args.messages);
    print_result("Workers", config.max_workers);

    let manager = JobManager::builder(config)
        .factory(SimulatedStep::FACTORY_KEY, SimulatedStep::factory)
        .start()
        .await?;

    // Record the order in which each job first starts running.
    let started: Arc<Mutex<Vec<JobId>>> = Arc::default();
    let mut events = manager.subscribe();
    let log = Arc::clone(&started);
    let recorder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.state == JobState::Running => {
                    if let Ok(mut started) = log.lock() {
                        if !started.contains(&event.job_id) {
                            started.push(event.job_id);
                        }
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    print_section("Enqueue");
    let mut queues: BTreeMap<String, Vec<JobId>> = BTreeMap::new();
    let mut ids = Vec::new();
    for message in 0..args.messages {
        for conversation in 0..args.conversations {
            let queue = format!("conversation-{conversation}");
            let step = SimulatedStep::new(format!("{queue}/message-{message}"))
                .with_work(50 + (conversation as u64) * 20)
                .with_failure_rate(args.failure_rate)
                .with_parameters(Parameters::new().queue(queue.as_str()).max_attempts(5));
            let id = manager.add(step);
            queues.entry(queue).or_default().push(id);
            ids.push(id);
        }
    }
    print_result("Jobs", ids.len());

    print_section("Run");
    let start = Instant::now();
    let outcome = track(&manager, &ids, Duration::from_secs(120), !args.no_progress).await;
    print_result("Elapsed", format!("{:.2?}", start.elapsed()));

    manager.shutdown().await;
    recorder.abort();
    let started = started
        .lock()
        .map(|started| started.clone())
        .map_err(|_| anyhow::anyhow!("start order log poisoned"))?;

    print_section("Ordering");
    for (queue, expected) in &queues {
        let observed: Vec<JobId> = started
            .iter()
            .filter(|id| expected.contains(id))
            .copied()
            .collect();
        if observed == *expected {
            print_success(&format!("{queue}: {} messages in order", observed.len()));
        } else {
            print_failure(&format!(
                "{queue}: started {} of {} in a different order",
                observed.len(),
                expected.len()
            ));
        }
    }

    print_section("Summary");
    print_outcome(&outcome);
    Ok(())
}
