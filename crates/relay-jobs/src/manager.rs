//! The job manager: public handle plus the control loop that owns all
//! scheduling state.
//!
//! Every mutation of in-memory state happens on a single task. Callers talk to
//! it through a command channel; constraints wake it through their notifiers;
//! job bodies run on a bounded [`JoinSet`] and report back as completions.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain::{Chain, ChainBuilder, DependencyGraph, PlannedJob};
use crate::config::EngineConfig;
use crate::constraint::{Constraint, ConstraintRegistry};
use crate::error::{JobError, SchedResult};
use crate::factory::{FactoryRegistry, JobFactory, ReconstructError};
use crate::job::{FailureReason, Job, JobContext, JobId, JobRecord, JobState};
use crate::persistence::JobStore;
use crate::queue::QueueSerializer;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tracker::{JobEvent, JobTracker};

/// Counts describing the engine at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Jobs waiting for their first run or for eligibility.
    pub pending: usize,

    /// Jobs waiting for their backoff to elapse.
    pub retrying: usize,

    /// Job bodies currently executing.
    pub running: usize,

    /// Queue keys with at least one job.
    pub queues: usize,

    /// Recovered records no registered factory can rebuild.
    pub parked: usize,
}

enum Command {
    Enqueue {
        jobs: Vec<PlannedJob>,
    },
    Cancel {
        job_id: JobId,
    },
    CancelQueue {
        queue_key: String,
    },
    Watch {
        job_id: JobId,
        waiter: oneshot::Sender<JobState>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Configures and starts a [`JobManager`].
pub struct JobManagerBuilder {
    config: EngineConfig,
    factories: FactoryRegistry,
    constraints: ConstraintRegistry,
    store: Option<Arc<dyn JobStore>>,
}

impl JobManagerBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            factories: FactoryRegistry::new(),
            constraints: ConstraintRegistry::new(),
            store: None,
        }
    }

    /// Register the factory that rebuilds jobs reporting `factory_key`.
    pub fn factory(mut self, factory_key: impl Into<String>, factory: impl JobFactory + 'static) -> Self {
        self.factories.register(factory_key, factory);
        self
    }

    /// Register a named constraint.
    pub fn constraint(mut self, name: impl Into<String>, constraint: Arc<dyn Constraint>) -> Self {
        self.constraints.register(name, constraint);
        self
    }

    /// Use this store instead of the one described by the configuration.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Recover persisted jobs and start the control loop.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(self) -> SchedResult<JobManager> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => self.config.store.open().await?,
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let tracker = JobTracker::new(self.config.terminal_cache_size);
        let events = tracker.sender();

        self.constraints.attach(&change_tx);

        let mut actor = Actor {
            retry: RetryPolicy::new(self.config.backoff.clone()),
            tracker,
            config: self.config,
            store,
            factories: self.factories,
            constraints: self.constraints,
            jobs: FxHashMap::default(),
            parked: FxHashSet::default(),
            queues: QueueSerializer::new(),
            graph: DependencyGraph::new(),
            workers: JoinSet::new(),
            next_seq: 0,
            stopping: false,
        };
        actor.recover().await?;

        let handle = tokio::spawn(actor.run(cmd_rx, change_rx));
        tracing::info!("Job manager started");

        Ok(JobManager {
            cmd_tx,
            events,
            actor: Arc::new(Mutex::new(Some(handle))),
        })
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<JobEvent>,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("stopped", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl JobManager {
    /// Start configuring an engine.
    pub fn builder(config: EngineConfig) -> JobManagerBuilder {
        JobManagerBuilder::new(config)
    }

    /// Enqueue a job. Failures surface through the job's `on_failure`, never
    /// to the caller.
    pub fn add(&self, job: impl Job + 'static) -> JobId {
        self.add_shared(Arc::new(job))
    }

    /// Enqueue an already shared job.
    pub fn add_shared(&self, job: Arc<dyn Job>) -> JobId {
        let job_id = JobId::new();
        self.send(Command::Enqueue {
            jobs: vec![PlannedJob {
                id: job_id,
                job,
                dependencies: Vec::new(),
            }],
        });
        job_id
    }

    /// Begin a chain whose first stage is `jobs`.
    pub fn start_chain(&self, jobs: Vec<Arc<dyn Job>>) -> ChainBuilder<'_> {
        ChainBuilder::new(self, jobs)
    }

    pub(crate) fn enqueue_chain(&self, chain: Chain) -> Vec<JobId> {
        let planned = chain.plan();
        let ids = planned.iter().map(|p| p.id).collect();
        if !planned.is_empty() {
            self.send(Command::Enqueue { jobs: planned });
        }
        ids
    }

    /// Fail every pending job of a queue and signal cancellation to the one
    /// that is running.
    pub fn cancel_all_in_queue(&self, queue_key: impl Into<String>) {
        self.send(Command::CancelQueue {
            queue_key: queue_key.into(),
        });
    }

    /// Fail a pending job, or signal cancellation if it is running.
    pub fn cancel(&self, job_id: JobId) {
        self.send(Command::Cancel { job_id });
    }

    /// Enqueue a job and wait for its terminal state. `None` on timeout.
    pub async fn run_synchronously(&self, job: Arc<dyn Job>, timeout: Duration) -> Option<JobState> {
        let job_id = self.add_shared(job);
        self.wait_for(job_id, timeout).await
    }

    /// Wait for a job to reach a terminal state.
    ///
    /// Returns `None` on timeout, for jobs the engine does not know, and for
    /// jobs that finished so long ago that their outcome was evicted.
    pub async fn wait_for(&self, job_id: JobId, timeout: Duration) -> Option<JobState> {
        let (waiter, rx) = oneshot::channel();
        self.send(Command::Watch { job_id, waiter });
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(state)) => Some(state),
            _ => None,
        }
    }

    /// Receive every subsequent job state change.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Resolves once every previously issued command has been applied and
    /// persisted.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        self.send(Command::Flush { done });
        let _ = rx.await;
    }

    /// Snapshot of engine counters. All zeros once the engine has stopped.
    pub async fn stats(&self) -> EngineStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply });
        rx.await.unwrap_or_default()
    }

    /// Stop dispatching, give running jobs up to the configured timeout to
    /// finish, then stop the control loop. Unfinished jobs are recovered on
    /// the next start.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        self.send(Command::Shutdown { done });
        let _ = rx.await;

        if let Some(handle) = self.actor.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Job manager task ended abnormally");
            }
        }
    }

    /// Whether the control loop has stopped.
    pub fn is_stopped(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    fn send(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.cmd_tx.send(command) {
            if let Command::Enqueue { jobs } = command {
                tracing::error!(jobs = jobs.len(), "Job manager stopped; dropping enqueued jobs");
            }
        }
    }
}

/// A job the engine is tracking.
struct Entry {
    record: JobRecord,
    job: Arc<dyn Job>,
    state: JobState,
    cancel: CancellationToken,
}

/// What a worker reports when a body returns.
struct RunOutcome {
    job_id: JobId,
    result: Result<(), String>,
    retryable: bool,
    canceled: bool,
}

struct Actor {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    factories: FactoryRegistry,
    constraints: ConstraintRegistry,
    retry: RetryPolicy,
    tracker: JobTracker,
    jobs: FxHashMap<JobId, Entry>,
    /// Recovered records without a factory. They stay in the store and keep
    /// blocking their dependents.
    parked: FxHashSet<JobId>,
    queues: QueueSerializer,
    graph: DependencyGraph,
    workers: JoinSet<RunOutcome>,
    next_seq: u64,
    stopping: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut change_rx: mpsc::UnboundedReceiver<Arc<str>>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let wakeup = self.next_wakeup();

            tokio::select! {
                biased;

                command = cmd_rx.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All job manager handles dropped");
                        self.drain_workers().await;
                        break;
                    };
                    if let Command::Shutdown { done } = command {
                        self.drain_workers().await;
                        let _ = done.send(());
                        break;
                    }
                    self.handle_command(command).await;
                }
                Some(joined) = self.workers.join_next() => {
                    match joined {
                        Ok(outcome) => self.on_completed(outcome).await,
                        Err(e) => tracing::error!(error = %e, "Worker task failed"),
                    }
                    self.schedule().await;
                }
                Some(name) = change_rx.recv() => {
                    tracing::debug!(constraint = %name, "Constraint changed");
                    self.schedule().await;
                }
                _ = sweep.tick() => {
                    self.tracker.prune_waiters();
                    self.schedule().await;
                }
                _ = tokio::time::sleep(wakeup.unwrap_or_default()), if wakeup.is_some() => {
                    self.schedule().await;
                }
            }
        }

        cmd_rx.close();
        let mut dropped = 0;
        while let Ok(command) = cmd_rx.try_recv() {
            match command {
                Command::Enqueue { jobs } => dropped += jobs.len(),
                Command::Shutdown { done } => {
                    let _ = done.send(());
                }
                _ => {}
            }
        }
        if dropped > 0 {
            tracing::warn!(jobs = dropped, "Jobs enqueued during shutdown were dropped");
        }

        tracing::info!(pending = self.jobs.len(), "Job manager stopped");
    }

    /// Rebuild in-memory state from the store.
    #[instrument(skip(self))]
    async fn recover(&mut self) -> SchedResult<()> {
        let records = self.store.load_all_pending().await?;
        self.next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);

        let mut restored = Vec::new();
        let mut rejected = Vec::new();

        for record in records {
            match self.factories.reconstruct(&record) {
                Ok(job) => restored.push((record, job)),
                Err(ReconstructError::UnknownFactory(key)) => {
                    tracing::warn!(
                        job_id = %record.id,
                        factory_key = %key,
                        "No factory registered; leaving record in store"
                    );
                    self.parked.insert(record.id);
                    self.graph.add_node(record.id);
                }
                Err(ReconstructError::Rejected(e)) => {
                    tracing::warn!(
                        job_id = %record.id,
                        factory_key = %record.factory_key,
                        error = %e,
                        "Factory rejected persisted payload"
                    );
                    rejected.push((record, e));
                }
            }
        }

        // Nodes first so edges can point either way in seq order.
        for (record, _) in &restored {
            self.graph.add_node(record.id);
        }
        for (record, _) in &rejected {
            self.graph.add_node(record.id);
        }
        for (record, _) in &restored {
            if let Err(e) = self.graph.link(record.id, &record.dependencies) {
                tracing::warn!(job_id = %record.id, error = %e, "Ignoring persisted dependency");
            }
        }
        for (record, _) in &rejected {
            if let Err(e) = self.graph.link(record.id, &record.dependencies) {
                tracing::warn!(job_id = %record.id, error = %e, "Ignoring persisted dependency");
            }
        }

        let restored_count = restored.len();
        for (mut record, job) in restored {
            // The increment is saved before the body runs, so a record with no
            // retry time and no attempts left was cut off during its final
            // attempt. That attempt never reported back; hand it back.
            if record.next_run_at.is_none() && !record.has_attempts_remaining() {
                record.attempt_count = record.attempt_count.saturating_sub(1);
                tracing::info!(
                    job_id = %record.id,
                    attempt = record.attempt_count.saturating_add(1),
                    "Resuming interrupted final attempt"
                );
            }
            let state = if record.next_run_at.is_some() {
                JobState::PendingRetry
            } else {
                JobState::Pending
            };
            if let Some(queue_key) = &record.queue_key {
                self.queues.push(queue_key, record.id);
            }
            self.jobs.insert(
                record.id,
                Entry {
                    record,
                    job,
                    state,
                    cancel: CancellationToken::new(),
                },
            );
        }

        for (record, e) in rejected {
            if let Err(err) = self.store.remove(&record.id).await {
                tracing::error!(job_id = %record.id, error = %err, "Failed to remove unrecoverable record");
            }
            self.fail_dependents(record.id).await;
            self.graph.remove(&record.id);
            self.tracker.publish(JobEvent::failed(
                record.id,
                record.factory_key,
                FailureReason::Unrecoverable(e.to_string()),
            ));
        }

        tracing::info!(
            restored = restored_count,
            parked = self.parked.len(),
            "Recovered persisted jobs"
        );
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { jobs } => {
                self.enqueue(jobs).await;
                self.schedule().await;
            }
            Command::Cancel { job_id } => {
                self.cancel(job_id).await;
                self.schedule().await;
            }
            Command::CancelQueue { queue_key } => {
                let job_ids = self.queues.job_ids(&queue_key);
                tracing::info!(queue = %queue_key, jobs = job_ids.len(), "Canceling queue");
                for job_id in job_ids {
                    self.cancel(job_id).await;
                }
                self.schedule().await;
            }
            Command::Watch { job_id, waiter } => {
                let known = self.jobs.contains_key(&job_id)
                    || self.parked.contains(&job_id)
                    || self.tracker.terminal_state(&job_id).is_some();
                // Dropping the waiter resolves the wait with `None`.
                if known {
                    self.tracker.watch(job_id, waiter);
                }
            }
            Command::Flush { done } => {
                let _ = done.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            queues: self.queues.keys().count(),
            parked: self.parked.len(),
            ..EngineStats::default()
        };
        for entry in self.jobs.values() {
            match entry.state {
                JobState::Pending => stats.pending += 1,
                JobState::PendingRetry => stats.retrying += 1,
                JobState::Running => stats.running += 1,
                JobState::Succeeded | JobState::FailedPermanent => {}
            }
        }
        stats
    }

    async fn enqueue(&mut self, planned: Vec<PlannedJob>) {
        let mut admitted = Vec::with_capacity(planned.len());
        for PlannedJob {
            id,
            job,
            dependencies,
        } in planned
        {
            let parameters = job.parameters();
            let record = JobRecord::new(
                id,
                self.next_seq,
                job.factory_key(),
                &parameters,
                job.serialize(),
            )
            .depends_on_all(dependencies);
            self.next_seq += 1;
            admitted.push((record, job));
        }

        let durable: Vec<JobRecord> = admitted
            .iter()
            .filter(|(record, _)| !record.memory_only)
            .map(|(record, _)| record.clone())
            .collect();

        if !durable.is_empty() {
            if let Err(e) = self.store.persist_all(&durable).await {
                tracing::error!(jobs = admitted.len(), error = %e, "Failed to persist enqueued jobs");
                let reason = FailureReason::StoreUnavailable(e.to_string());
                let mut failed = Vec::with_capacity(admitted.len());
                for (record, job) in admitted {
                    self.tracker
                        .publish(JobEvent::failed(record.id, record.factory_key, reason.clone()));
                    failed.push(job);
                }
                run_on_failure(failed);
                return;
            }
        }

        for (record, job) in admitted {
            self.admit(record, job).await;
        }
    }

    async fn admit(&mut self, record: JobRecord, job: Arc<dyn Job>) {
        let job_id = record.id;

        if let Err(e) = self.graph.add_job(job_id, &record.dependencies) {
            tracing::warn!(job_id = %job_id, error = %e, "Ignoring dependency");
        }
        if let Some(queue_key) = &record.queue_key {
            self.queues.push(queue_key, job_id);
        }

        tracing::debug!(
            job_id = %job_id,
            factory_key = %record.factory_key,
            queue = ?record.queue_key,
            seq = record.seq,
            "Job enqueued"
        );

        // A dependency that already failed dooms the dependent right away.
        let failed_dependency = record.dependencies.iter().copied().find(|dep| {
            !self.graph.contains(dep)
                && self.tracker.terminal_state(dep) == Some(JobState::FailedPermanent)
        });

        self.tracker
            .publish(JobEvent::new(job_id, record.factory_key.clone(), JobState::Pending));
        self.jobs.insert(
            job_id,
            Entry {
                record,
                job,
                state: JobState::Pending,
                cancel: CancellationToken::new(),
            },
        );

        if let Some(dep) = failed_dependency {
            self.fail_job(job_id, FailureReason::DependencyFailed(dep)).await;
        }
    }

    async fn cancel(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get(&job_id) else {
            tracing::debug!(job_id = %job_id, "Cancel requested for unknown job");
            return;
        };

        if entry.state == JobState::Running {
            tracing::info!(job_id = %job_id, "Signaling cancellation to running job");
            entry.cancel.cancel();
        } else {
            self.fail_job(job_id, FailureReason::Canceled).await;
        }
    }

    /// Run one scheduling pass: fail expired jobs, then start eligible jobs
    /// in submission order until the worker pool is full.
    async fn schedule(&mut self) {
        if self.stopping {
            return;
        }
        let now = Utc::now();

        let mut doomed = Vec::new();
        for (job_id, entry) in &self.jobs {
            if entry.state == JobState::Running {
                continue;
            }
            if entry.record.is_expired(now) {
                doomed.push((*job_id, FailureReason::Expired));
            }
        }
        for (job_id, reason) in doomed {
            // An earlier cascade may already have taken it.
            if self.jobs.contains_key(&job_id) {
                self.fail_job(job_id, reason).await;
            }
        }

        let mut candidates: Vec<(u64, JobId)> = self
            .jobs
            .values()
            .filter(|e| matches!(e.state, JobState::Pending | JobState::PendingRetry))
            .map(|e| (e.record.seq, e.record.id))
            .collect();
        candidates.sort_unstable();

        let mut started = 0;
        for (_, job_id) in candidates {
            if self.workers.len() >= self.config.max_workers {
                break;
            }

            let Some(entry) = self.jobs.get(&job_id) else {
                continue;
            };
            let record = &entry.record;
            let eligible = record.backoff_elapsed(now)
                && self.graph.is_satisfied(&job_id)
                && record
                    .queue_key
                    .as_deref()
                    .is_none_or(|key| self.queues.is_head(key, &job_id))
                && self.constraints.all_met(&record.constraints);

            if eligible && self.dispatch(job_id).await {
                started += 1;
            }
        }

        if started > 0 {
            tracing::debug!(started, running = self.workers.len(), "Scheduling pass");
        }
    }

    /// Count the attempt durably, then hand the body to a worker.
    async fn dispatch(&mut self, job_id: JobId) -> bool {
        let Some(entry) = self.jobs.get(&job_id) else {
            return false;
        };
        let attempt = entry.record.attempt_count.saturating_add(1);

        if !entry.record.memory_only {
            if let Err(e) = self.store.update_attempt(&job_id, attempt, None).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record attempt; job stays pending");
                return false;
            }
        }

        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        entry.record.attempt_count = attempt;
        entry.record.next_run_at = None;
        entry.state = JobState::Running;

        let job = entry.job.clone();
        let token = entry.cancel.clone();
        let factory_key = entry.record.factory_key.clone();

        tracing::info!(job_id = %job_id, factory_key = %factory_key, attempt, "Running job");
        self.tracker
            .publish(JobEvent::new(job_id, factory_key, JobState::Running));

        self.workers.spawn(async move {
            let ctx = JobContext::new(job_id, attempt, token.clone());
            let result = AssertUnwindSafe(job.on_run(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(JobError::fatal("job body panicked")));
            let retryable = result.as_ref().err().is_some_and(|e| job.on_should_retry(e));

            RunOutcome {
                job_id,
                result: result.map_err(|e| e.to_string()),
                retryable,
                canceled: token.is_cancelled(),
            }
        });
        true
    }

    async fn on_completed(&mut self, outcome: RunOutcome) {
        let RunOutcome {
            job_id,
            result,
            retryable,
            canceled,
        } = outcome;

        if !self.jobs.contains_key(&job_id) {
            tracing::warn!(job_id = %job_id, "Completion for untracked job");
            return;
        }

        let error = match result {
            _ if canceled => {
                tracing::info!(job_id = %job_id, "Job canceled");
                self.fail_job(job_id, FailureReason::Canceled).await;
                return;
            }
            Ok(()) => {
                self.succeed(job_id).await;
                return;
            }
            Err(error) => error,
        };

        let now = Utc::now();
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        match self.retry.decide(&entry.record, retryable, &error, now) {
            RetryDecision::Retry { delay, next_run_at } => {
                tracing::warn!(
                    job_id = %job_id,
                    factory_key = %entry.record.factory_key,
                    attempt = entry.record.attempt_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Job failed; retrying"
                );
                let attempt_count = entry.record.attempt_count;
                let memory_only = entry.record.memory_only;

                if !memory_only {
                    if let Err(e) = self
                        .store
                        .update_attempt(&job_id, attempt_count, Some(next_run_at))
                        .await
                    {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to persist retry time");
                    }
                }

                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.record.next_run_at = Some(next_run_at);
                    entry.state = JobState::PendingRetry;
                    let factory_key = entry.record.factory_key.clone();
                    self.tracker
                        .publish(JobEvent::new(job_id, factory_key, JobState::PendingRetry));
                }
            }
            RetryDecision::Fail(reason) => {
                tracing::warn!(
                    job_id = %job_id,
                    factory_key = %entry.record.factory_key,
                    attempt = entry.record.attempt_count,
                    error = %error,
                    reason = %reason,
                    "Job failed permanently"
                );
                self.fail_job(job_id, reason).await;
            }
        }
    }

    async fn succeed(&mut self, job_id: JobId) {
        let Some(entry) = self.forget(job_id) else {
            return;
        };

        if !entry.record.memory_only {
            if let Err(e) = self.store.remove(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to remove finished job; it will run again after restart");
            }
        }

        tracing::info!(
            job_id = %job_id,
            factory_key = %entry.record.factory_key,
            attempt = entry.record.attempt_count,
            "Job succeeded"
        );
        self.tracker
            .publish(JobEvent::new(job_id, entry.record.factory_key, JobState::Succeeded));
    }

    /// Finalize a job as permanently failed along with every dependent that
    /// has not started, calling `on_failure` once for each.
    async fn fail_job(&mut self, job_id: JobId, reason: FailureReason) {
        let cascade = self.dependents_to_fail(job_id);

        let mut failed = Vec::with_capacity(1 + cascade.len());
        failed.push((job_id, reason));
        failed.extend(
            cascade
                .into_iter()
                .map(|dep| (dep, FailureReason::DependencyFailed(job_id))),
        );

        self.finalize_failures(failed).await;
    }

    /// Fail the dependents of a job that is not itself tracked.
    async fn fail_dependents(&mut self, job_id: JobId) {
        let failed = self
            .dependents_to_fail(job_id)
            .into_iter()
            .map(|dep| (dep, FailureReason::DependencyFailed(job_id)))
            .collect();
        self.finalize_failures(failed).await;
    }

    fn dependents_to_fail(&self, job_id: JobId) -> Vec<JobId> {
        self.graph
            .transitive_dependents(&job_id)
            .into_iter()
            .filter(|dep| {
                self.jobs
                    .get(dep)
                    .is_some_and(|entry| entry.state != JobState::Running)
            })
            .collect()
    }

    async fn finalize_failures(&mut self, failed: Vec<(JobId, FailureReason)>) {
        let mut removed = Vec::new();
        let mut durable = Vec::new();

        for (job_id, reason) in failed {
            let Some(entry) = self.forget(job_id) else {
                continue;
            };
            if !entry.record.memory_only {
                durable.push(job_id);
            }
            if let FailureReason::DependencyFailed(cause) = &reason {
                tracing::info!(job_id = %job_id, dependency = %cause, "Failing dependent job");
            }
            self.tracker
                .publish(JobEvent::failed(job_id, entry.record.factory_key, reason));
            removed.push(entry.job);
        }

        if !durable.is_empty() {
            if let Err(e) = self.store.remove_all(&durable).await {
                tracing::error!(jobs = durable.len(), error = %e, "Failed to remove failed jobs");
            }
        }

        run_on_failure(removed);
    }

    /// Drop a job from every in-memory structure.
    fn forget(&mut self, job_id: JobId) -> Option<Entry> {
        let entry = self.jobs.remove(&job_id)?;
        if let Some(queue_key) = &entry.record.queue_key {
            self.queues.remove(queue_key, &job_id);
        }
        self.graph.remove(&job_id);
        Some(entry)
    }

    /// Earliest future backoff deadline, as a delay from now.
    fn next_wakeup(&self) -> Option<Duration> {
        let now = Utc::now();
        self.jobs
            .values()
            .filter(|e| e.state == JobState::PendingRetry)
            .filter_map(|e| e.record.next_run_at)
            .filter(|at| *at > now)
            .min()
            .map(|at| (at - now).to_std().unwrap_or_default())
    }

    /// Stop dispatching and wait for running bodies, up to the shutdown
    /// timeout.
    async fn drain_workers(&mut self) {
        self.stopping = true;
        if self.workers.is_empty() {
            return;
        }

        tracing::info!(running = self.workers.len(), "Waiting for running jobs");
        let deadline = tokio::time::sleep(self.config.shutdown_timeout());
        tokio::pin!(deadline);

        while !self.workers.is_empty() {
            tokio::select! {
                Some(joined) = self.workers.join_next() => match joined {
                    Ok(outcome) => self.on_completed(outcome).await,
                    Err(e) => tracing::error!(error = %e, "Worker task failed"),
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        running = self.workers.len(),
                        "Shutdown timed out; abandoning running jobs"
                    );
                    self.workers.abort_all();
                    break;
                }
            }
        }
    }
}

/// Call `on_failure` for each job on a separate task.
fn run_on_failure(jobs: Vec<Arc<dyn Job>>) {
    if jobs.is_empty() {
        return;
    }
    tokio::spawn(async move {
        futures::future::join_all(jobs.iter().map(|job| job.on_failure())).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::job::Parameters;
    use crate::persistence::SqliteStore;
    use crate::retry::BackoffConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        runs: Arc<AtomicU32>,
        failures: Arc<AtomicU32>,
        parameters: Parameters,
        fatal: bool,
    }

    #[async_trait]
    impl Job for Counting {
        fn factory_key(&self) -> &str {
            "Counting"
        }

        fn parameters(&self) -> Parameters {
            self.parameters.clone()
        }

        async fn on_run(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                Err(JobError::fatal("rejected"))
            } else {
                Ok(())
            }
        }

        async fn on_failure(&self) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            backoff: BackoffConfig::exponential(Duration::from_millis(5), Duration::from_millis(20)),
            ..EngineConfig::default()
        }
    }

    async fn manager() -> JobManager {
        JobManager::builder(config())
            .store(Arc::new(SqliteStore::in_memory().unwrap()))
            .start()
            .await
            .unwrap()
    }

    fn counting(parameters: Parameters, fatal: bool) -> (Arc<Counting>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let job = Arc::new(Counting {
            runs: runs.clone(),
            failures: failures.clone(),
            parameters,
            fatal,
        });
        (job, runs, failures)
    }

    #[tokio::test]
    async fn test_run_synchronously_success() {
        let manager = manager().await;
        let (job, runs, failures) = counting(Parameters::new(), false);

        let state = manager.run_synchronously(job, Duration::from_secs(5)).await;
        assert_eq!(state, Some(JobState::Succeeded));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        manager.shutdown().await;
        assert!(manager.is_stopped());
    }

    #[tokio::test]
    async fn test_fatal_error_fails_once() {
        let manager = manager().await;
        let (job, runs, _) = counting(Parameters::new().max_attempts(5), true);

        let state = manager.run_synchronously(job, Duration::from_secs(5)).await;
        assert_eq!(state, Some(JobState::FailedPermanent));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_unknown_job() {
        let manager = manager().await;
        let state = manager.wait_for(JobId::new(), Duration::from_secs(5)).await;
        assert_eq!(state, None);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_and_flush() {
        let manager = manager().await;
        let (job, runs, _) = counting(Parameters::new().add_constraint("NeverRegistered"), false);

        manager.add_shared(job);
        manager.flush().await;

        let stats = manager.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        manager.shutdown().await;
        assert_eq!(manager.stats().await, EngineStats::default());
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_harmless() {
        let manager = manager().await;
        manager.shutdown().await;

        let (job, runs, _) = counting(Parameters::new(), false);
        manager.add_shared(job);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // A second shutdown is a no-op.
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_fails_permanently() {
        struct Panics;

        #[async_trait]
        impl Job for Panics {
            fn factory_key(&self) -> &str {
                "Panics"
            }

            async fn on_run(&self, _ctx: &JobContext) -> Result<(), JobError> {
                panic!("boom");
            }
        }

        let manager = manager().await;
        let state = manager
            .run_synchronously(Arc::new(Panics), Duration::from_secs(5))
            .await;
        assert_eq!(state, Some(JobState::FailedPermanent));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_at_enqueue() {
        struct BrokenStore;

        #[async_trait]
        impl JobStore for BrokenStore {
            async fn persist(&self, _record: &JobRecord) -> SchedResult<()> {
                Err(crate::error::SchedError::DatabaseError("disk full".into()))
            }

            async fn update_attempt(
                &self,
                _job_id: &JobId,
                _attempt_count: u32,
                _next_run_at: Option<chrono::DateTime<Utc>>,
            ) -> SchedResult<()> {
                Ok(())
            }

            async fn remove(&self, _job_id: &JobId) -> SchedResult<bool> {
                Ok(false)
            }

            async fn load(&self, _job_id: &JobId) -> SchedResult<Option<JobRecord>> {
                Ok(None)
            }

            async fn load_all_pending(&self) -> SchedResult<Vec<JobRecord>> {
                Ok(Vec::new())
            }
        }

        let manager = JobManager::builder(config())
            .store(Arc::new(BrokenStore))
            .start()
            .await
            .unwrap();
        let mut events = manager.subscribe();

        let (job, runs, failures) = counting(Parameters::new(), false);
        let state = manager.run_synchronously(job, Duration::from_secs(5)).await;
        assert_eq!(state, Some(JobState::FailedPermanent));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let event = events.recv().await.unwrap();
        assert!(matches!(event.reason, Some(FailureReason::StoreUnavailable(_))));

        // on_failure runs on a spawned task
        for _ in 0..100 {
            if failures.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // Memory-only jobs never touch the store.
        let (job, runs, _) = counting(Parameters::new().memory_only(true), false);
        let state = manager.run_synchronously(job, Duration::from_secs(5)).await;
        assert_eq!(state, Some(JobState::Succeeded));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_payload_is_persisted() {
        struct WithPayload;

        #[async_trait]
        impl Job for WithPayload {
            fn factory_key(&self) -> &str {
                "WithPayload"
            }

            fn parameters(&self) -> Parameters {
                Parameters::new().add_constraint("Offline")
            }

            fn serialize(&self) -> Data {
                Data::builder().put_string("recipient", "alice").build()
            }

            async fn on_run(&self, _ctx: &JobContext) -> Result<(), JobError> {
                Ok(())
            }
        }

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let manager = JobManager::builder(config())
            .store(store.clone())
            .start()
            .await
            .unwrap();

        let job_id = manager.add(WithPayload);
        manager.flush().await;

        let record = store.load(&job_id).await.unwrap().unwrap();
        assert_eq!(record.factory_key, "WithPayload");
        assert_eq!(record.payload.get_string("recipient").unwrap(), "alice");
        assert_eq!(record.constraints, vec!["Offline"]);
        manager.shutdown().await;
    }
}
