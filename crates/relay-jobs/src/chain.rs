//! Dependency tracking and multi-stage job chains.

use std::sync::Arc;

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Bfs;

use crate::error::{SchedError, SchedResult};
use crate::job::{Job, JobId};
use crate::manager::JobManager;

/// Live dependency edges between non-terminal jobs.
///
/// An edge `a -> b` means `b` waits for `a`. Only jobs that have not reached a
/// terminal state are nodes: a dependency that is not in the graph has already
/// succeeded (successful jobs are removed) and so never blocks.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraphMap<JobId, ()>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job with no edges yet.
    pub fn add_node(&mut self, job_id: JobId) {
        self.graph.add_node(job_id);
    }

    /// Add a dependency edge between two tracked jobs.
    ///
    /// The `from` job must succeed before the `to` job can start.
    pub fn add_dependency(&mut self, from: JobId, to: JobId) -> SchedResult<()> {
        if from == to {
            return Err(SchedError::InvalidDependency(to.to_string()));
        }
        if !self.graph.contains_node(from) {
            return Err(SchedError::JobNotFound(from.to_string()));
        }
        if !self.graph.contains_node(to) {
            return Err(SchedError::JobNotFound(to.to_string()));
        }

        // Check for cycles
        if petgraph::algo::has_path_connecting(&self.graph, to, from, None) {
            return Err(SchedError::DependencyCycle(to.to_string()));
        }

        self.graph.add_edge(from, to, ());
        Ok(())
    }

    /// Track a job and wire it to whichever of its dependencies are still live.
    pub fn add_job(&mut self, job_id: JobId, dependencies: &[JobId]) -> SchedResult<()> {
        self.add_node(job_id);
        self.link(job_id, dependencies)
    }

    /// Wire an already tracked job to its live dependencies.
    pub fn link(&mut self, job_id: JobId, dependencies: &[JobId]) -> SchedResult<()> {
        for dep in dependencies {
            if self.graph.contains_node(*dep) {
                self.add_dependency(*dep, job_id)?;
            }
        }
        Ok(())
    }

    /// Check if a job is tracked.
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.graph.contains_node(*job_id)
    }

    /// Whether every dependency of the job has succeeded.
    pub fn is_satisfied(&self, job_id: &JobId) -> bool {
        self.graph
            .neighbors_directed(*job_id, Direction::Incoming)
            .next()
            .is_none()
    }

    /// Live dependencies of a job.
    pub fn dependencies(&self, job_id: &JobId) -> Vec<JobId> {
        self.graph
            .neighbors_directed(*job_id, Direction::Incoming)
            .collect()
    }

    /// Jobs that directly wait on this job.
    pub fn dependents(&self, job_id: &JobId) -> Vec<JobId> {
        self.graph
            .neighbors_directed(*job_id, Direction::Outgoing)
            .collect()
    }

    /// Every job that waits on this job, directly or through others, in
    /// breadth-first order.
    pub fn transitive_dependents(&self, job_id: &JobId) -> Vec<JobId> {
        if !self.graph.contains_node(*job_id) {
            return Vec::new();
        }
        let mut bfs = Bfs::new(&self.graph, *job_id);
        let mut out = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != *job_id {
                out.push(node);
            }
        }
        out
    }

    /// Stop tracking a job, releasing its dependents' edges.
    ///
    /// Returns the dependents that became unblocked.
    pub fn remove(&mut self, job_id: &JobId) -> Vec<JobId> {
        let dependents = self.dependents(job_id);
        self.graph.remove_node(*job_id);
        dependents
            .into_iter()
            .filter(|id| self.is_satisfied(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// A job of a planned chain with its ID and dependencies fixed.
#[derive(Clone)]
pub struct PlannedJob {
    pub id: JobId,
    pub job: Arc<dyn Job>,
    pub dependencies: Vec<JobId>,
}

impl std::fmt::Debug for PlannedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedJob")
            .field("id", &self.id)
            .field("factory_key", &self.job.factory_key())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Sequence of stages; every job of a stage depends on every job of the
/// stage before it. Jobs within a stage may run in parallel.
#[derive(Default, Clone)]
pub struct Chain {
    stages: Vec<Vec<Arc<dyn Job>>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Empty stages are ignored.
    pub fn then(mut self, jobs: impl IntoIterator<Item = Arc<dyn Job>>) -> Self {
        let stage: Vec<_> = jobs.into_iter().collect();
        if !stage.is_empty() {
            self.stages.push(stage);
        }
        self
    }

    /// Number of non-empty stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Total number of jobs.
    pub fn len(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Assign IDs and wire stage-to-stage dependencies, in submission order.
    pub fn plan(self) -> Vec<PlannedJob> {
        let mut planned = Vec::with_capacity(self.len());
        let mut previous: Vec<JobId> = Vec::new();

        for stage in self.stages {
            let ids: Vec<JobId> = stage.iter().map(|_| JobId::new()).collect();
            for (id, job) in ids.iter().zip(stage) {
                planned.push(PlannedJob {
                    id: *id,
                    job,
                    dependencies: previous.clone(),
                });
            }
            previous = ids;
        }

        planned
    }
}

/// Fluent builder returned by [`JobManager::start_chain`].
pub struct ChainBuilder<'a> {
    manager: &'a JobManager,
    chain: Chain,
}

impl<'a> ChainBuilder<'a> {
    pub(crate) fn new(manager: &'a JobManager, first: Vec<Arc<dyn Job>>) -> Self {
        Self {
            manager,
            chain: Chain::new().then(first),
        }
    }

    /// Add a stage that runs once every job of the previous stage succeeded.
    pub fn then(mut self, jobs: impl IntoIterator<Item = Arc<dyn Job>>) -> Self {
        self.chain = self.chain.then(jobs);
        self
    }

    /// Persist every job of the chain at once and hand it to the scheduler.
    ///
    /// Returns the IDs of all jobs, in stage order.
    pub fn enqueue(self) -> Vec<JobId> {
        self.manager.enqueue_chain(self.chain)
    }
}
