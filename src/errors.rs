//! Error taxonomy shared by the ingest pipeline and the query engine.

use std::io;

use thiserror::Error;

pub type Result<T, E = SnapshotError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Connection resets, timeouts and 5xx responses. Retried by the
    /// download engine; surfaces only once all attempts are exhausted.
    #[error("transient network error for {url}: {message}")]
    TransientNetwork { url: String, message: String },

    /// A missing URL. Ingest continues; a missing suite/component/arch
    /// combination is logged, never fatal.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Downloaded bytes do not hash to the published value. The blob is not
    /// committed and the next candidate URL is tried.
    #[error("{url}: wrong SHA256: {computed} (expected: {expected})")]
    HashMismatch {
        url: String,
        computed: String,
        expected: String,
    },

    /// No timestamp enumeration could be obtained for an archive. Aborts
    /// ingest for that archive only.
    #[error("timestamp catalog unavailable for archive {archive}: {message}")]
    CatalogUnavailable { archive: String, message: String },

    /// Object store failure (disk full, permissions, corrupt blob).
    #[error("store error at {path}: {message}")]
    Store { path: String, message: String },

    /// Transactional index failure. The current timestamp's commit rolls
    /// back and the driver continues with the next timestamp.
    #[error("index error for {scope}: {message}")]
    Index { scope: String, message: String },

    /// A malformed metadata paragraph. Skipped and counted per paragraph.
    #[error("parse error in {origin}: {message}")]
    Parse { origin: String, message: String },

    /// Every candidate URL for an artifact failed.
    #[error("no more URLs to try for {sha256}")]
    FetchExhausted { sha256: String },
}

impl SnapshotError {
    /// Whether the retry policy may re-attempt the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, SnapshotError::TransientNetwork { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound { .. })
    }

    /// Classify a transport-level failure: 404 and other client errors are
    /// terminal, everything else (connect, timeout, 5xx, protocol) is
    /// retryable.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return SnapshotError::NotFound {
                    url: url.to_string(),
                };
            }
            if status.is_client_error() {
                return SnapshotError::NotFound {
                    url: url.to_string(),
                };
            }
        }
        SnapshotError::TransientNetwork {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn from_status(url: &str, status: reqwest::StatusCode) -> Self {
        if status.is_server_error() {
            SnapshotError::TransientNetwork {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            }
        } else {
            SnapshotError::NotFound {
                url: url.to_string(),
            }
        }
    }

    pub fn store<P: AsRef<std::path::Path>>(path: P, err: io::Error) -> Self {
        SnapshotError::Store {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn index(scope: &str, err: sqlx::Error) -> Self {
        SnapshotError::Index {
            scope: scope.to_string(),
            message: err.to_string(),
        }
    }

    pub fn parse(origin: &str, message: impl ToString) -> Self {
        SnapshotError::Parse {
            origin: origin.to_string(),
            message: message.to_string(),
        }
    }
}
