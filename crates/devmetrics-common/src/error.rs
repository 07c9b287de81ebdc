use std::fmt;

/// Failure classes shared by every transport binding.
///
/// Each binding translates a kind into its own status vocabulary, so two
/// bindings fed the same input always land in the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    NotImplemented,
    NotFound,
    InternalServer,
    Decrypt,
    Decompress,
    IpNotAllowed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::NotFound => "not found",
            ErrorKind::InternalServer => "internal server error",
            ErrorKind::Decrypt => "decrypt error",
            ErrorKind::Decompress => "decompress error",
            ErrorKind::IpNotAllowed => "ip address not allowed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while parsing, verifying, encoding or querying metrics.
///
/// # Examples
///
/// ```
/// use devmetrics_common::error::{ErrorKind, MetricError};
///
/// let err = MetricError::UnknownType("notcounter".to_string());
/// assert_eq!(err.kind(), ErrorKind::NotImplemented);
/// assert!(err.to_string().contains("notcounter"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("unknown metric type '{0}'")]
    UnknownType(String),

    #[error("invalid {kind} value '{text}'")]
    InvalidValue { kind: &'static str, text: String },

    /// A gauge record without `value`, or a counter record without `delta`.
    #[error("metric '{id}' of type {kind} carries no {field}")]
    MissingValue {
        id: String,
        kind: &'static str,
        field: &'static str,
    },

    #[error("metric '{id}' is stored as {stored}, cannot ingest {incoming}")]
    TypeConflict {
        id: String,
        stored: &'static str,
        incoming: &'static str,
    },

    #[error("hash mismatch for metric '{id}'")]
    HashMismatch { id: String },

    #[error("metric '{id}' carries no hash")]
    MissingHash { id: String },

    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("metric '{id}' of type {kind} not found")]
    NotFound { id: String, kind: String },

    #[error("decrypt: {0}")]
    Decrypt(String),

    #[error("decompress: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("origin '{0}' is outside the trusted subnet")]
    IpNotAllowed(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl MetricError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetricError::UnknownType(_) => ErrorKind::NotImplemented,
            MetricError::InvalidValue { .. }
            | MetricError::MissingValue { .. }
            | MetricError::TypeConflict { .. }
            | MetricError::HashMismatch { .. }
            | MetricError::MissingHash { .. }
            | MetricError::MalformedJson(_) => ErrorKind::BadRequest,
            MetricError::NotFound { .. } => ErrorKind::NotFound,
            MetricError::Decrypt(_) => ErrorKind::Decrypt,
            MetricError::Decompress(_) => ErrorKind::Decompress,
            MetricError::IpNotAllowed(_) => ErrorKind::IpNotAllowed,
            MetricError::Unavailable(_) | MetricError::Internal(_) => ErrorKind::InternalServer,
        }
    }
}

/// Convenience `Result` alias for metric operations.
pub type Result<T> = std::result::Result<T, MetricError>;
