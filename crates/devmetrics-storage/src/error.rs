/// Errors raised by snapshot backends.
///
/// # Examples
///
/// ```rust
/// use devmetrics_storage::error::StorageError;
///
/// let err = StorageError::PingUnsupported { backend: "file" };
/// assert!(err.to_string().contains("file"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Snapshot (de)serialization failure.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage: I/O error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// The backend has no liveness check (only database backends answer ping).
    #[error("Storage: {backend} backend does not support ping")]
    PingUnsupported { backend: &'static str },

    /// A stored row that no longer maps to a metric value.
    #[error("Storage: corrupt row for metric '{id}': {reason}")]
    CorruptRow { id: String, reason: String },
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
