/// Error types for the workflow engine
///
/// One enum per layer: the resource store, the status packer, the task backend,
/// and the engine itself. `EngineError` is what callers of the core see; the
/// other enums convert into it.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine, the archive and the cron trigger.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed workflow (cycle, unknown dependency, bad template reference).
    /// Rejected at submission, never executed.
    #[error("Invalid workflow: {0}")]
    Validation(String),

    /// Dispatch failure or store unavailability. Retried with backoff.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// A task ran and reported failure.
    #[error("Task failed: {0}")]
    TaskFailure(String),

    /// Stored status cannot be decoded. Retrying reads the same bytes.
    #[error("Corrupt workflow status: {0}")]
    Corrupt(String),

    /// Packed status still exceeds the size limit.
    #[error("Workflow status too large: {size} bytes exceeds limit of {limit} bytes")]
    Capacity { size: usize, limit: usize },

    /// Requested resource or archived record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict; the caller should requeue.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A resource with the same key already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Relational store failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the condition is expected to clear on its own (requeue, don't surface).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_) | EngineError::Infrastructure(_) | EngineError::Database(_)
        )
    }
}

/// Errors from a `ResourceStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("resource version conflict on {namespace}/{name}: expected {expected}, found {actual}")]
    Conflict {
        namespace: String,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => EngineError::NotFound(err.to_string()),
            StoreError::AlreadyExists { .. } => EngineError::AlreadyExists(err.to_string()),
            StoreError::Conflict { .. } => EngineError::Conflict(err.to_string()),
            StoreError::Database(e) => EngineError::Database(e),
            StoreError::Serialization(e) => EngineError::Serialization(e),
        }
    }
}

/// Errors from the status packer.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("packed status is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("packed status is corrupt: {0}")]
    Corrupt(String),

    #[error("packed status checksum mismatch: expected {expected}, computed {actual}")]
    Checksum { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PackError> for EngineError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::TooLarge { size, limit } => EngineError::Capacity { size, limit },
            PackError::Serialization(e) => EngineError::Serialization(e),
            other @ (PackError::Corrupt(_) | PackError::Checksum { .. }) => {
                EngineError::Corrupt(other.to_string())
            }
        }
    }
}

/// Errors from a `TaskBackend`.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to dispatch task {node_id}: {reason}")]
    Dispatch { node_id: String, reason: String },

    #[error("task {0} not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        EngineError::Infrastructure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_status_is_not_retried() {
        let corrupt: EngineError = PackError::Corrupt("bad base64".to_string()).into();
        assert!(matches!(corrupt, EngineError::Corrupt(_)));
        assert!(!corrupt.is_transient());

        let checksum: EngineError = PackError::Checksum {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        }
        .into();
        assert!(matches!(checksum, EngineError::Corrupt(_)));
        assert!(!checksum.is_transient());
    }

    #[test]
    fn test_too_large_maps_to_capacity() {
        let err: EngineError = PackError::TooLarge { size: 10, limit: 5 }.into();
        assert!(matches!(err, EngineError::Capacity { size: 10, limit: 5 }));
    }
}
