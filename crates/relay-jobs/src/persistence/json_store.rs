//! JSON file-based persistence for development and testing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{SchedError, SchedResult};
use crate::job::{JobId, JobRecord};
use crate::persistence::JobStore;

/// JSON file-based job store.
///
/// Stores each job as a separate JSON file, written to a temporary file and
/// renamed into place. A batch is committed file by file in submission order,
/// so a crash mid-batch can only lose a suffix of a chain, never leave a later
/// stage without its predecessors.
pub struct JsonStore {
    /// Base directory for storage.
    base_dir: PathBuf,

    /// In-memory cache of records.
    cache: RwLock<FxHashMap<JobId, JobRecord>>,
}

impl JsonStore {
    /// Create a new JSON store at the given path.
    pub async fn new(base_dir: impl AsRef<Path>) -> SchedResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(base_dir.join("jobs")).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(FxHashMap::default()),
        };

        // Load existing records into cache
        store.load_all_jobs().await?;

        Ok(store)
    }

    /// Create a new JSON store in a temporary directory.
    pub async fn temp() -> SchedResult<Self> {
        let temp_dir = std::env::temp_dir().join(format!("relay-jobs-{}", uuid::Uuid::new_v4()));
        Self::new(temp_dir).await
    }

    /// Directory holding the job files.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn job_path(&self, job_id: &JobId) -> PathBuf {
        self.base_dir.join("jobs").join(format!("{job_id}.json"))
    }

    fn tmp_path(&self, job_id: &JobId) -> PathBuf {
        self.base_dir.join("jobs").join(format!("{job_id}.json.tmp"))
    }

    async fn load_all_jobs(&self) -> SchedResult<()> {
        let jobs_dir = self.base_dir.join("jobs");
        let mut cache = self.cache.write().await;

        let mut entries = fs::read_dir(&jobs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            // Leftovers of a write interrupted before its rename
            if path.extension().is_some_and(|ext| ext == "tmp") {
                if let Err(e) = fs::remove_file(&path).await {
                    tracing::warn!("Failed to remove partial write {:?}: {}", path, e);
                }
                continue;
            }

            if path.extension().is_some_and(|ext| ext == "json") {
                match fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<JobRecord>(&content) {
                        Ok(record) => {
                            cache.insert(record.id, record);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to parse job file {:?}: {}", path, e);
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Failed to read job file {:?}: {}", path, e);
                    }
                }
            }
        }

        Ok(())
    }

    async fn write_record(&self, record: &JobRecord) -> SchedResult<()> {
        let tmp = self.tmp_path(&record.id);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, self.job_path(&record.id)).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonStore {
    async fn persist(&self, record: &JobRecord) -> SchedResult<()> {
        self.write_record(record).await?;

        // Update cache
        let mut cache = self.cache.write().await;
        cache.insert(record.id, record.clone());

        Ok(())
    }

    async fn persist_all(&self, records: &[JobRecord]) -> SchedResult<()> {
        let mut cache = self.cache.write().await;
        for record in records {
            self.write_record(record).await?;
            cache.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn update_attempt(
        &self,
        job_id: &JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> SchedResult<()> {
        let mut cache = self.cache.write().await;

        let Some(record) = cache.get_mut(job_id) else {
            return Err(SchedError::JobNotFound(job_id.to_string()));
        };
        record.attempt_count = attempt_count;
        record.next_run_at = next_run_at;

        let record = record.clone();
        self.write_record(&record).await
    }

    async fn remove(&self, job_id: &JobId) -> SchedResult<bool> {
        let mut cache = self.cache.write().await;
        let cached = cache.remove(job_id).is_some();

        match fs::remove_file(self.job_path(job_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(cached),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }

    async fn load(&self, job_id: &JobId) -> SchedResult<Option<JobRecord>> {
        let cache = self.cache.read().await;
        Ok(cache.get(job_id).cloned())
    }

    async fn load_all_pending(&self) -> SchedResult<Vec<JobRecord>> {
        let cache = self.cache.read().await;
        let mut records: Vec<JobRecord> = cache.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}
