//! Error handling for the job engine.

use thiserror::Error;

use crate::data::DataError;

/// Result type for engine operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors raised by the engine itself (stores, registry, lifecycle).
///
/// These never reach callers of `add` or chain enqueue; they surface only from
/// lifecycle calls such as `start` and store construction.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Job not found in the engine or store.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A record references a factory key nobody registered.
    #[error("Unknown factory: {0}")]
    UnknownFactory(String),

    /// Job dependency cycle detected.
    #[error("Dependency cycle detected involving job {0}")]
    DependencyCycle(String),

    /// Invalid dependency reference.
    #[error("Invalid dependency: job {0} cannot depend on itself")]
    InvalidDependency(String),

    /// Persistence error.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// SQLite database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The control loop is no longer running.
    #[error("Engine stopped")]
    EngineStopped,

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for SchedError {
    fn from(e: rusqlite::Error) -> Self {
        SchedError::DatabaseError(e.to_string())
    }
}

impl From<crate::config::ConfigError> for SchedError {
    fn from(e: crate::config::ConfigError) -> Self {
        SchedError::ConfigError(e.to_string())
    }
}

/// Error returned by a job body or a job factory.
#[derive(Error, Debug)]
pub enum JobError {
    /// Transient failure; the job asks to be retried later.
    #[error("Retry later: {0}")]
    Retry(String),

    /// Permanent failure; no further attempts.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// The job observed its cancellation flag and stopped.
    #[error("Canceled")]
    Canceled,

    /// Payload could not be decoded.
    #[error("Malformed payload: {0}")]
    Data(#[from] DataError),

    /// Anything else raised by job code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Create a retryable error.
    pub fn retry(reason: impl Into<String>) -> Self {
        JobError::Retry(reason.into())
    }

    /// Create a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        JobError::Fatal(reason.into())
    }

    /// Whether the default retry classification treats this error as transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retry(_))
    }
}
