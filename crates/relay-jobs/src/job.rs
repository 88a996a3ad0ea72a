//! Job contract, parameters and the durable job record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::data::Data;
use crate::error::JobError;

/// Unique identifier for a job, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upper bound on how many times a job body may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxAttempts {
    Limited(u32),
    Unlimited,
}

impl MaxAttempts {
    /// Whether another attempt may start after `attempt_count` attempts.
    pub fn allows(&self, attempt_count: u32) -> bool {
        match self {
            MaxAttempts::Limited(max) => attempt_count < *max,
            MaxAttempts::Unlimited => true,
        }
    }
}

impl Default for MaxAttempts {
    fn default() -> Self {
        MaxAttempts::Limited(1)
    }
}

/// Scheduling parameters a job is enqueued with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters {
    /// Jobs sharing a queue key run one at a time in submission order.
    pub queue: Option<String>,

    /// Names of constraints that must all be met before the job runs.
    pub constraints: Vec<String>,

    /// Maximum age before the job is considered expired. `None` is immortal.
    pub lifespan: Option<Duration>,

    /// Attempt limit.
    pub max_attempts: MaxAttempts,

    /// Keep the job out of the store.
    pub memory_only: bool,
}

impl Parameters {
    /// Parameters with all defaults: no queue, no constraints, immortal,
    /// a single attempt, persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize this job behind every other job with the same key.
    pub fn queue(mut self, key: impl Into<String>) -> Self {
        self.queue = Some(key.into());
        self
    }

    /// Require a named constraint. Adding the same name twice is a no-op.
    pub fn add_constraint(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.constraints.contains(&name) {
            self.constraints.push(name);
        }
        self
    }

    /// Expire the job once it is older than `lifespan`.
    pub fn lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    /// Never expire the job.
    pub fn immortal(mut self) -> Self {
        self.lifespan = None;
        self
    }

    /// Allow at most `n` runs. Values below 1 are raised to 1.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = MaxAttempts::Limited(n.max(1));
        self
    }

    /// Retry for as long as the job keeps asking.
    pub fn unlimited_attempts(mut self) -> Self {
        self.max_attempts = MaxAttempts::Unlimited;
        self
    }

    /// Keep the job in memory only; it is lost if the process dies.
    pub fn memory_only(mut self, memory_only: bool) -> Self {
        self.memory_only = memory_only;
        self
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for constraints, dependencies or its turn in the queue.
    Pending,

    /// Body is executing on a worker.
    Running,

    /// Failed transiently; waiting for backoff to elapse.
    PendingRetry,

    /// Finished successfully.
    Succeeded,

    /// Failed for good; `on_failure` has been called.
    FailedPermanent,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedPermanent)
    }

    /// Check if the job completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }

    /// Get a human-readable state name.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::PendingRetry => "PendingRetry",
            JobState::Succeeded => "Succeeded",
            JobState::FailedPermanent => "FailedPermanent",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a job ended up permanently failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The body returned a non-retryable error.
    Error(String),

    /// The last allowed attempt failed.
    AttemptsExhausted,

    /// The job outlived its lifespan.
    Expired,

    /// The job was canceled.
    Canceled,

    /// A job this one depends on failed.
    DependencyFailed(JobId),

    /// The job could not be persisted at enqueue time.
    StoreUnavailable(String),

    /// The factory rejected the persisted payload.
    Unrecoverable(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Error(e) => write!(f, "{e}"),
            FailureReason::AttemptsExhausted => write!(f, "attempts exhausted"),
            FailureReason::Expired => write!(f, "lifespan exceeded"),
            FailureReason::Canceled => write!(f, "canceled"),
            FailureReason::DependencyFailed(id) => write!(f, "dependency {id} failed"),
            FailureReason::StoreUnavailable(e) => write!(f, "could not persist: {e}"),
            FailureReason::Unrecoverable(e) => write!(f, "could not reconstruct: {e}"),
        }
    }
}

/// Per-run context handed to [`Job::on_run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    attempt: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(id: JobId, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            id,
            attempt,
            cancel,
        }
    }

    /// ID of the running job.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// 1-based number of this run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether cancellation was requested. Long-running bodies should poll this.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }
}

/// A unit of deferred work.
///
/// Implementations carry their own state; the engine persists it through
/// [`Job::serialize`] and rebuilds it with the [`JobFactory`](crate::factory::JobFactory)
/// registered under [`Job::factory_key`].
#[async_trait]
pub trait Job: Send + Sync {
    /// Key of the factory that can rebuild this job from its payload.
    fn factory_key(&self) -> &str;

    /// Scheduling parameters. Read once, at enqueue.
    fn parameters(&self) -> Parameters {
        Parameters::default()
    }

    /// Encode the job's state.
    fn serialize(&self) -> Data {
        Data::empty()
    }

    /// Do the work. `Ok` means success.
    async fn on_run(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Classify an error returned by `on_run` as transient.
    fn on_should_retry(&self, error: &JobError) -> bool {
        error.is_retryable()
    }

    /// Called at most once, when the job fails permanently.
    async fn on_failure(&self) {}
}

/// The durable form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: JobId,

    /// Engine-assigned submission order.
    pub seq: u64,

    /// Factory that rebuilds the job.
    pub factory_key: String,

    /// FIFO group.
    pub queue_key: Option<String>,

    /// Job-owned payload.
    pub payload: Data,

    /// Constraint names, in the order they were added.
    pub constraints: Vec<String>,

    /// Jobs that must succeed first.
    pub dependencies: Vec<JobId>,

    /// Enqueue timestamp.
    pub created_at: DateTime<Utc>,

    /// Lifespan in milliseconds; `None` is immortal.
    pub lifespan_ms: Option<u64>,

    /// Attempt limit.
    pub max_attempts: MaxAttempts,

    /// Runs started so far.
    pub attempt_count: u32,

    /// Earliest time of the next run after a transient failure.
    pub next_run_at: Option<DateTime<Utc>>,

    /// Never written to the store.
    pub memory_only: bool,
}

impl JobRecord {
    /// Build the record for a freshly enqueued job.
    pub fn new(
        id: JobId,
        seq: u64,
        factory_key: impl Into<String>,
        parameters: &Parameters,
        payload: Data,
    ) -> Self {
        Self {
            id,
            seq,
            factory_key: factory_key.into(),
            queue_key: parameters.queue.clone(),
            payload,
            constraints: parameters.constraints.clone(),
            dependencies: Vec::new(),
            created_at: Utc::now(),
            lifespan_ms: parameters
                .lifespan
                .map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX)),
            max_attempts: parameters.max_attempts,
            attempt_count: 0,
            next_run_at: None,
            memory_only: parameters.memory_only,
        }
    }

    /// Add a dependency. Duplicates and self-references are ignored.
    pub fn depends_on(mut self, job_id: JobId) -> Self {
        if job_id != self.id && !self.dependencies.contains(&job_id) {
            self.dependencies.push(job_id);
        }
        self
    }

    /// Add multiple dependencies.
    pub fn depends_on_all(self, job_ids: impl IntoIterator<Item = JobId>) -> Self {
        job_ids.into_iter().fold(self, JobRecord::depends_on)
    }

    /// Rebuild the parameters this record was enqueued with.
    pub fn parameters(&self) -> Parameters {
        Parameters {
            queue: self.queue_key.clone(),
            constraints: self.constraints.clone(),
            lifespan: self.lifespan_ms.map(Duration::from_millis),
            max_attempts: self.max_attempts,
            memory_only: self.memory_only,
        }
    }

    /// Point in time after which the job is expired.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lifespan = chrono::Duration::milliseconds(
            i64::try_from(self.lifespan_ms?).unwrap_or(i64::MAX),
        );
        self.created_at.checked_add_signed(lifespan)
    }

    /// Whether the job has outlived its lifespan.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| deadline < now)
    }

    /// Whether another attempt may start.
    pub fn has_attempts_remaining(&self) -> bool {
        self.max_attempts.allows(self.attempt_count)
    }

    /// Whether any backoff delay has elapsed.
    pub fn backoff_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_none_or(|at| at <= now)
    }
}
