//! Persistence layer for job records.

mod json_store;
mod sqlite_store;

pub use json_store::JsonStore;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SchedResult;
use crate::job::{JobId, JobRecord};

/// Durable storage for job records.
///
/// Records are written when a job is enqueued and deleted when it reaches a
/// terminal state, so everything a store holds is pending work. On startup
/// [`JobStore::load_all_pending`] is the only source the engine rebuilds its
/// schedule from.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a record.
    async fn persist(&self, record: &JobRecord) -> SchedResult<()>;

    /// Insert several records at once. Implementations with transactions
    /// write all or nothing.
    async fn persist_all(&self, records: &[JobRecord]) -> SchedResult<()> {
        for record in records {
            self.persist(record).await?;
        }
        Ok(())
    }

    /// Record the attempt count and backoff deadline of a job.
    async fn update_attempt(
        &self,
        job_id: &JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> SchedResult<()>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, job_id: &JobId) -> SchedResult<bool>;

    /// Delete several records at once. Returns how many existed.
    async fn remove_all(&self, job_ids: &[JobId]) -> SchedResult<usize> {
        let mut removed = 0;
        for job_id in job_ids {
            if self.remove(job_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Load a single record.
    async fn load(&self, job_id: &JobId) -> SchedResult<Option<JobRecord>>;

    /// Load every stored record in submission order.
    async fn load_all_pending(&self) -> SchedResult<Vec<JobRecord>>;
}
