//! # Pipeline Error Types
//!
//! Unified error handling for the skypipe engine, its worker processes and
//! the ctl surface.

use thiserror::Error;

/// Pipeline operation result type
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error kinds surfaced by the task-execution engine
///
/// Worker-internal failures are *data*, not errors: a task that raises or
/// exits non-zero becomes a `failed` record and client code observes it as
/// [`PipelineError::TaskFailed`] through `TaskFuture::result()`.
/// Infrastructure failures (store, provider launch) propagate to the manager
/// process, which logs and continues when recoverable and exits when not.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("enqueue rejected: {0}")]
    Enqueue(String),

    #[error("task {task_id} failed: {err}")]
    TaskFailed { task_id: i64, err: String },

    #[error("queue store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("cached result {fingerprint} is corrupt: {reason}")]
    CacheCorrupt { fingerprint: String, reason: String },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create an enqueue rejection
    pub fn enqueue(message: impl Into<String>) -> Self {
        Self::Enqueue(message.into())
    }

    /// Create a store-unavailable error (missing file, held manager lock)
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Create a provider launch/poll error
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Create a corrupt-cache error; callers treat this as a miss
    pub fn cache_corrupt(fingerprint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheCorrupt {
            fingerprint: fingerprint.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a catalog error
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }

    /// Check if the manager loop may continue after this error
    ///
    /// Provider failures mark a single record failed and scheduling goes on;
    /// a corrupt cache entry is re-run. Store and configuration errors take
    /// the manager down.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Provider(_) => true,
            PipelineError::CacheCorrupt { .. } => true,
            PipelineError::TaskFailed { .. } => true,
            PipelineError::Database(e) => matches!(e, sqlx::Error::PoolTimedOut),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Constructor tests ----

    #[test]
    fn test_enqueue_constructor() {
        let err = PipelineError::enqueue("unknown dependency id 7");
        match err {
            PipelineError::Enqueue(msg) => assert_eq!(msg, "unknown dependency id 7"),
            _ => panic!("Expected Enqueue variant"),
        }
    }

    #[test]
    fn test_cache_corrupt_constructor() {
        let err = PipelineError::cache_corrupt("abc123", "truncated payload");
        match err {
            PipelineError::CacheCorrupt {
                fingerprint,
                reason,
            } => {
                assert_eq!(fingerprint, "abc123");
                assert_eq!(reason, "truncated payload");
            }
            _ => panic!("Expected CacheCorrupt variant"),
        }
    }

    // ---- is_recoverable tests ----

    #[test]
    fn test_provider_error_is_recoverable() {
        assert!(PipelineError::provider("sbatch not found").is_recoverable());
    }

    #[test]
    fn test_cache_corrupt_is_recoverable() {
        assert!(PipelineError::cache_corrupt("fp", "bad json").is_recoverable());
    }

    #[test]
    fn test_store_unavailable_not_recoverable() {
        assert!(!PipelineError::store_unavailable("locked").is_recoverable());
    }

    #[test]
    fn test_config_error_not_recoverable() {
        assert!(!PipelineError::config("bad base_dir").is_recoverable());
    }

    // ---- Display tests ----

    #[test]
    fn test_display_task_failed() {
        let err = PipelineError::TaskFailed {
            task_id: 42,
            err: "division by zero".to_string(),
        };
        assert_eq!(format!("{err}"), "task 42 failed: division by zero");
    }

    #[test]
    fn test_display_store_unavailable() {
        let err = PipelineError::store_unavailable("no such queue file");
        assert_eq!(
            format!("{err}"),
            "queue store unavailable: no such queue file"
        );
    }
}
