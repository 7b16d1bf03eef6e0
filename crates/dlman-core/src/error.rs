//! Error types for DLMan core

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine and recorded on downloads.
///
/// The six named kinds above the `---` are the classification taxonomy used
/// by the supervisor to decide retry vs. fatal; the rest are ambient
/// plumbing failures that don't need their own retry policy.
#[derive(Debug, Error)]
pub enum DlmanError {
    /// Timeouts, connection resets, 5xx, 429. Retried up to `max_retries`.
    #[error("network error: {0}")]
    NetworkTransient(String),

    /// 4xx other than 408/429, DNS failure, malformed URL. Fatal.
    #[error("client error: {0}")]
    ClientPermanent(String),

    /// Size/ETag/Last-Modified mismatch on resume, or 200 where 206 was
    /// expected. Fatal — the server's content moved under us.
    #[error("remote content changed: {0}")]
    ContentChanged(String),

    /// Disk full, permission denied, path gone. Fatal.
    #[error("io error at {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// User-initiated stop. Not a failure.
    #[error("cancelled")]
    Cancelled,

    /// Should be unreachable; logged at error severity, download marked
    /// failed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // --- ambient plumbing ---
    #[error("download not found: {0}")]
    NotFound(Uuid),

    #[error("queue not found: {0}")]
    QueueNotFound(Uuid),

    #[error("category not found: {0}")]
    CategoryNotFound(Uuid),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DlmanError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        DlmanError::IoError {
            path: path.into(),
            source,
        }
    }

    /// Classify a transport error per §4.A / §7: connect/timeout errors are
    /// transient, everything else from reqwest is treated as permanent.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            DlmanError::NetworkTransient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                DlmanError::NetworkTransient(format!("{status}: {err}"))
            } else {
                DlmanError::ClientPermanent(format!("{status}: {err}"))
            }
        } else {
            DlmanError::NetworkTransient(err.to_string())
        }
    }

    /// Whether the supervisor should retry the segment that raised this
    /// error, rather than marking the whole download failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DlmanError::NetworkTransient(_))
    }

    /// HTTP status this error kind should be reported as when it reaches
    /// the control server.
    pub fn status_code(&self) -> u16 {
        match self {
            DlmanError::NotFound(_) | DlmanError::QueueNotFound(_) | DlmanError::CategoryNotFound(_) => 404,
            DlmanError::ClientPermanent(_) | DlmanError::InvalidOperation(_) => 400,
            DlmanError::ContentChanged(_) => 409,
            _ => 500,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            DlmanError::NetworkTransient(_) => "network_transient",
            DlmanError::ClientPermanent(_) => "client_permanent",
            DlmanError::ContentChanged(_) => "content_changed",
            DlmanError::IoError { .. } | DlmanError::Io(_) => "io_error",
            DlmanError::Cancelled => "cancelled",
            DlmanError::InvariantViolation(_) => "invariant_violation",
            DlmanError::NotFound(_) => "not_found",
            DlmanError::QueueNotFound(_) => "queue_not_found",
            DlmanError::CategoryNotFound(_) => "category_not_found",
            DlmanError::InvalidOperation(_) => "invalid_operation",
            DlmanError::Database(_) => "database_error",
            DlmanError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<DlmanError> for String {
    fn from(error: DlmanError) -> Self {
        error.to_string()
    }
}
