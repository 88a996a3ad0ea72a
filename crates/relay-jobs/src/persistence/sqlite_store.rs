//! SQLite-based persistence for production use.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

use crate::data::Data;
use crate::error::{SchedError, SchedResult};
use crate::job::{JobId, JobRecord, MaxAttempts};
use crate::persistence::JobStore;

const SELECT_COLUMNS: &str = "id, seq, factory_key, queue_key, payload, constraints, \
     dependencies, created_at, lifespan_ms, max_attempts, attempt_count, next_run_at, memory_only";

/// SQLite-based job store.
///
/// Every mutation runs in its own transaction, so a crash leaves each record
/// exactly as it was last fully written. Recommended for production use.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> SchedResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    /// Create a new in-memory SQLite store.
    pub fn in_memory() -> SchedResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    fn lock(&self) -> SchedResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SchedError::DatabaseError(e.to_string()))
    }

    fn init_schema_sync(&self) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                factory_key TEXT NOT NULL,
                queue_key TEXT,
                payload TEXT NOT NULL,
                constraints TEXT NOT NULL,
                dependencies TEXT NOT NULL,
                created_at TEXT NOT NULL,
                lifespan_ms INTEGER,
                max_attempts INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                memory_only INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_seq ON jobs(seq);
            CREATE INDEX IF NOT EXISTS idx_jobs_queue_key ON jobs(queue_key);
            "#,
        )?;
        Ok(())
    }

    fn insert(conn: &Connection, record: &JobRecord) -> SchedResult<()> {
        let max_attempts = match record.max_attempts {
            MaxAttempts::Limited(n) => Some(i64::from(n)),
            MaxAttempts::Unlimited => None,
        };

        conn.execute(
            r#"
            INSERT OR REPLACE INTO jobs (id, seq, factory_key, queue_key, payload, constraints,
                dependencies, created_at, lifespan_ms, max_attempts, attempt_count, next_run_at,
                memory_only)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            rusqlite::params![
                record.id.to_string(),
                i64::try_from(record.seq).unwrap_or(i64::MAX),
                record.factory_key,
                record.queue_key,
                record.payload.to_json()?,
                serde_json::to_string(&record.constraints)?,
                serde_json::to_string(&record.dependencies)?,
                record.created_at.to_rfc3339(),
                record
                    .lifespan_ms
                    .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
                max_attempts,
                i64::from(record.attempt_count),
                record.next_run_at.map(|t| t.to_rfc3339()),
                record.memory_only,
            ],
        )?;
        Ok(())
    }

    fn parse_time(value: &str) -> SchedResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SchedError::PersistenceError(format!("bad timestamp {value:?}: {e}")))
    }

    fn row_to_record(row: &Row<'_>) -> SchedResult<JobRecord> {
        let id: String = row.get(0)?;
        let seq: i64 = row.get(1)?;
        let payload: String = row.get(4)?;
        let constraints: String = row.get(5)?;
        let dependencies: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let lifespan_ms: Option<i64> = row.get(8)?;
        let max_attempts: Option<i64> = row.get(9)?;
        let attempt_count: i64 = row.get(10)?;
        let next_run_at: Option<String> = row.get(11)?;

        Ok(JobRecord {
            id: JobId::parse(&id)
                .map_err(|e| SchedError::PersistenceError(format!("bad job id {id:?}: {e}")))?,
            seq: u64::try_from(seq).unwrap_or_default(),
            factory_key: row.get(2)?,
            queue_key: row.get(3)?,
            payload: Data::from_json(&payload)?,
            constraints: serde_json::from_str(&constraints)?,
            dependencies: serde_json::from_str(&dependencies)?,
            created_at: Self::parse_time(&created_at)?,
            lifespan_ms: lifespan_ms.map(|ms| u64::try_from(ms).unwrap_or_default()),
            max_attempts: match max_attempts {
                Some(n) => MaxAttempts::Limited(u32::try_from(n).unwrap_or(u32::MAX)),
                None => MaxAttempts::Unlimited,
            },
            attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
            next_run_at: next_run_at.as_deref().map(Self::parse_time).transpose()?,
            memory_only: row.get(12)?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn persist(&self, record: &JobRecord) -> SchedResult<()> {
        let conn = self.lock()?;
        Self::insert(&conn, record)
    }

    async fn persist_all(&self, records: &[JobRecord]) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in records {
            Self::insert(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn update_attempt(
        &self,
        job_id: &JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> SchedResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE jobs SET attempt_count = ?2, next_run_at = ?3 WHERE id = ?1",
            rusqlite::params![
                job_id.to_string(),
                i64::from(attempt_count),
                next_run_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        if updated == 0 {
            return Err(SchedError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, job_id: &JobId) -> SchedResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE id = ?1",
            rusqlite::params![job_id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    async fn remove_all(&self, job_ids: &[JobId]) -> SchedResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM jobs WHERE id = ?1")?;
            for job_id in job_ids {
                deleted += stmt.execute(rusqlite::params![job_id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn load(&self, job_id: &JobId) -> SchedResult<Option<JobRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?1"))?;
        let mut rows = stmt.query(rusqlite::params![job_id.to_string()])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_record(row)?))
        } else {
            Ok(None)
        }
    }

    async fn load_all_pending(&self) -> SchedResult<Vec<JobRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM jobs ORDER BY seq ASC"))?;
        let mut rows = stmt.query([])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            match Self::row_to_record(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let id: Option<String> = row.get(0).ok();
                    tracing::warn!(job_id = ?id, error = %e, "Skipping unreadable job row");
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Parameters;
    use std::time::Duration;

    fn record(seq: u64, parameters: &Parameters) -> JobRecord {
        let payload = Data::builder().put_string("thread", "conv-1").build();
        JobRecord::new(JobId::new(), seq, "PushSendJob", parameters, payload)
    }

    #[tokio::test]
    async fn test_sqlite_store_basic() {
        let store = SqliteStore::in_memory().unwrap();

        let params = Parameters::new()
            .queue("conv-1")
            .add_constraint("NetworkAvailable")
            .lifespan(Duration::from_secs(86_400))
            .max_attempts(3);
        let rec = record(1, &params).depends_on(JobId::new());
        let job_id = rec.id;

        // Persist
        store.persist(&rec).await.unwrap();

        // Load
        let loaded = store.load(&job_id).await.unwrap().unwrap();
        assert_eq!(loaded.factory_key, "PushSendJob");
        assert_eq!(loaded.parameters(), params);
        assert_eq!(loaded.dependencies, rec.dependencies);
        assert_eq!(loaded.payload, rec.payload);

        // Update attempt
        let next = Utc::now() + chrono::Duration::seconds(30);
        store.update_attempt(&job_id, 2, Some(next)).await.unwrap();
        let updated = store.load(&job_id).await.unwrap().unwrap();
        assert_eq!(updated.attempt_count, 2);
        assert_eq!(
            updated.next_run_at.map(|t| t.timestamp_millis()),
            Some(next.timestamp_millis())
        );

        // Remove
        assert!(store.remove(&job_id).await.unwrap());
        assert!(!store.remove(&job_id).await.unwrap());
        assert!(store.load(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.update_attempt(&JobId::new(), 1, None).await;
        assert!(matches!(err, Err(SchedError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_load_all_pending_in_seq_order() {
        let store = SqliteStore::in_memory().unwrap();
        let params = Parameters::new().unlimited_attempts();

        let late = record(7, &params);
        let early = record(2, &params);
        store.persist_all(&[late.clone(), early.clone()]).await.unwrap();

        let loaded = store.load_all_pending().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, early.id);
        assert_eq!(loaded[1].id, late.id);
        assert_eq!(loaded[1].max_attempts, MaxAttempts::Unlimited);

        assert_eq!(store.remove_all(&[early.id, JobId::new()]).await.unwrap(), 1);
        assert_eq!(store.load_all_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let rec = record(1, &Parameters::new().max_attempts(5));

        {
            let store = SqliteStore::open(&path).unwrap();
            store.persist(&rec).await.unwrap();
            store.update_attempt(&rec.id, 4, None).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_all_pending().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].attempt_count, 4);
        assert_eq!(loaded[0].max_attempts, MaxAttempts::Limited(5));
    }
}
