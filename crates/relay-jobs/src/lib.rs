//! Relay: a durable job execution engine
//!
//! This crate runs discrete units of deferred work (message sends, protocol
//! state advances, key rotations, profile fetches) and guarantees they
//! eventually execute despite process restarts, network loss and transient
//! failures.
//!
//! # Overview
//!
//! A job goes through the following steps:
//! 1. **Enqueue**: The job's parameters and payload are persisted
//! 2. **Scheduling**: The engine waits until the job is eligible
//! 3. **Execution**: The body runs on a bounded worker pool
//! 4. **Completion**: Success removes the record; failure retries with backoff
//!    or finalizes the job and calls its `on_failure`
//!
//! A job is eligible when it has not expired, all of its constraints are met,
//! all of its dependencies succeeded, it heads its queue and its backoff has
//! elapsed.
//!
//! # Key Features
//!
//! - **Durability**: SQLite or JSON file storage; state is rebuilt on start
//! - **Queues**: Strict FIFO with at most one running job per queue key
//! - **Constraints**: Named predicates such as `NetworkAvailable` gate jobs
//! - **Chains**: Multi-stage pipelines with cascading failure
//! - **Retry**: Exponential backoff with jitter and per-job attempt limits
//!
//! # Example: Single Job
//!
//! ```ignore
//! use relay_jobs::{EngineConfig, JobManager, FlagConstraint};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = FlagConstraint::new(false);
//!
//!     let manager = JobManager::builder(EngineConfig::load(None)?)
//!         .factory("PushSendJob", PushSendJob::factory)
//!         .constraint("NetworkAvailable", network.clone())
//!         .start()
//!         .await?;
//!
//!     let job_id = manager.add(PushSendJob::new("conv-1", "hello"));
//!     network.set(true);
//!
//!     let state = manager.wait_for(job_id, Duration::from_secs(30)).await;
//!     println!("{job_id}: {state:?}");
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Chain
//!
//! ```ignore
//! let ids = manager
//!     .start_chain(vec![compress_a, compress_b])
//!     .then(vec![upload])
//!     .then(vec![send])
//!     .enqueue();
//! ```

pub mod chain;
pub mod config;
pub mod constraint;
pub mod data;
pub mod error;
pub mod factory;
pub mod job;
pub mod manager;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod tracker;

// Re-exports
pub use chain::{Chain, ChainBuilder, DependencyGraph};
pub use config::{ConfigError, EngineConfig, LoggingConfig, StoreConfig};
pub use constraint::{Constraint, ConstraintNotifier, ConstraintRegistry, FlagConstraint};
pub use data::{Data, DataBuilder, DataError, DataValue};
pub use error::{JobError, SchedError, SchedResult};
pub use factory::{FactoryRegistry, JobFactory};
pub use job::{
    FailureReason, Job, JobContext, JobId, JobRecord, JobState, MaxAttempts, Parameters,
};
pub use manager::{EngineStats, JobManager, JobManagerBuilder};
pub use persistence::{JobStore, JsonStore, SqliteStore};
pub use queue::QueueSerializer;
pub use retry::{BackoffConfig, RetryDecision, RetryPolicy};
pub use tracker::{JobEvent, JobTracker};
