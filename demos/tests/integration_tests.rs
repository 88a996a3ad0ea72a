//! Integration tests for the demo suite.
//!
//! These run the demo workloads end to end on a temporary store with short
//! timings so they stay fast and deterministic.

use std::sync::Arc;
use std::time::Duration;

use relay_demos::jobs::SimulatedStep;
use relay_demos::{Outcome, track};
use relay_jobs::{
    BackoffConfig, EngineConfig, FlagConstraint, JobManager, JobState, JobStore, JsonStore,
    Parameters, SqliteStore,
};

const NETWORK: &str = "NetworkAvailable";

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_workers: 4,
        sweep_interval_ms: 50,
        backoff: BackoffConfig::exponential(Duration::from_millis(5), Duration::from_millis(20)),
        shutdown_timeout_secs: 5,
        ..EngineConfig::default()
    }
}

async fn start(store: Arc<dyn JobStore>, network: &Arc<FlagConstraint>) -> JobManager {
    JobManager::builder(fast_config())
        .factory(SimulatedStep::FACTORY_KEY, SimulatedStep::factory)
        .constraint(NETWORK, network.clone())
        .store(store)
        .start()
        .await
        .unwrap()
}

/// Test that the attachment chain completes once the network comes up.
#[tokio::test]
async fn test_chain_completes_after_network_returns() {
    let network = FlagConstraint::new(false);
    let manager = start(Arc::new(SqliteStore::in_memory().unwrap()), &network).await;

    let online = Parameters::new().add_constraint(NETWORK).max_attempts(3);
    let ids = manager
        .start_chain(vec![
            SimulatedStep::new("compress-a").with_work(10).shared(),
            SimulatedStep::new("compress-b").with_work(10).shared(),
        ])
        .then(vec![
            SimulatedStep::new("upload")
                .with_work(10)
                .with_parameters(online.clone())
                .shared(),
        ])
        .then(vec![
            SimulatedStep::new("send")
                .with_work(10)
                .with_parameters(online)
                .shared(),
        ])
        .enqueue();
    assert_eq!(ids.len(), 4);

    // Compression does not need the network.
    let compressed = manager.wait_for(ids[0], Duration::from_secs(5)).await;
    assert_eq!(compressed, Some(JobState::Succeeded));
    assert_eq!(manager.wait_for(ids[2], Duration::from_millis(100)).await, None);

    network.set(true);
    let outcome = track(&manager, &ids, Duration::from_secs(5), false).await;
    assert_eq!(
        outcome,
        Outcome {
            succeeded: 4,
            failed: 0,
            timed_out: 0
        }
    );

    manager.shutdown().await;
}

/// Test that a fatal compression fails the rest of the chain.
#[tokio::test]
async fn test_fatal_stage_fails_chain() {
    let network = FlagConstraint::new(true);
    let manager = start(Arc::new(SqliteStore::in_memory().unwrap()), &network).await;

    let ids = manager
        .start_chain(vec![
            SimulatedStep::new("compress")
                .with_work(10)
                .always_fatal()
                .shared(),
        ])
        .then(vec![SimulatedStep::new("upload").with_work(10).shared()])
        .then(vec![SimulatedStep::new("send").with_work(10).shared()])
        .enqueue();

    let outcome = track(&manager, &ids, Duration::from_secs(5), false).await;
    assert_eq!(outcome.failed, 3);
    assert_eq!(outcome.succeeded, 0);

    manager.shutdown().await;
}

/// Test that every message in a conversation queue is delivered even when
/// sends fail transiently.
#[tokio::test]
async fn test_queue_survives_transient_failures() {
    let network = FlagConstraint::new(true);
    let manager = start(Arc::new(SqliteStore::in_memory().unwrap()), &network).await;

    let ids: Vec<_> = (0..4)
        .map(|i| {
            manager.add(
                SimulatedStep::new(format!("message-{i}"))
                    .with_work(5)
                    .with_failure_rate(0.3)
                    .with_parameters(Parameters::new().queue("conversation").unlimited_attempts()),
            )
        })
        .collect();

    let outcome = track(&manager, &ids, Duration::from_secs(10), false).await;
    assert_eq!(outcome.succeeded, 4);

    manager.shutdown().await;
}

/// Test that jobs enqueued while offline are resumed by a new engine.
#[tokio::test]
async fn test_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let offline = FlagConstraint::new(false);
    let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(dir.path()).await.unwrap());
    let manager = start(store, &offline).await;
    let ids: Vec<_> = (0..3)
        .map(|i| {
            manager.add(
                SimulatedStep::new(format!("message-{i}"))
                    .with_work(5)
                    .with_parameters(Parameters::new().queue("outbox").add_constraint(NETWORK)),
            )
        })
        .collect();
    manager.flush().await;
    manager.shutdown().await;

    let store = JsonStore::new(dir.path()).await.unwrap();
    assert_eq!(store.load_all_pending().await.unwrap().len(), 3);

    let online = FlagConstraint::new(true);
    let manager = start(Arc::new(store), &online).await;
    let outcome = track(&manager, &ids, Duration::from_secs(5), false).await;
    assert_eq!(outcome.succeeded, 3);
    manager.shutdown().await;

    let store = JsonStore::new(dir.path()).await.unwrap();
    assert!(store.load_all_pending().await.unwrap().is_empty());
}
