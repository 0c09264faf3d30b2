use crate::retry::Retryable;
use thiserror::Error;

/// Failures talking HTTP to Tally, the proxy, or an edge function.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, timeout, TLS, body read...
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    /// The server answered with a non-success status.
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request { .. } => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Failures writing a chunk into a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid response: {0}")]
    Json(#[from] serde_json::Error),

    /// The edge function answered `success: false`.
    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl Retryable for SinkError {
    fn is_retryable(&self) -> bool {
        match self {
            SinkError::Transport(e) => e.is_retryable(),
            SinkError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A table import that gave up.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import of table {table} failed on chunk {chunk} after {attempts} attempt(s): {source}")]
    ChunkFailed {
        table: String,
        chunk: usize,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("clearing table {table} failed after {attempts} attempt(s): {source}")]
    ClearFailed {
        table: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("removing stale entries from {table} failed after {attempts} attempt(s): {source}")]
    PruneFailed {
        table: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

impl ImportError {
    pub fn table(&self) -> &str {
        match self {
            ImportError::ChunkFailed { table, .. }
            | ImportError::ClearFailed { table, .. }
            | ImportError::PruneFailed { table, .. } => table,
        }
    }
}
