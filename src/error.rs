use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by a single delivery attempt.
///
/// Every variant counts as a delivery failure: the record that triggered it
/// goes to the backlog.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection refused, DNS failure, timeout, broken body stream.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The endpoint answered with a non-2xx status.
    #[error("Endpoint rejected record ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The record could not be encoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Status code reported by the endpoint, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        // The request URL carries the auth key as a query parameter
        Self::Transport {
            message: err.without_url().to_string(),
        }
    }
}

/// Errors from the durable backlog file.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Backlog I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backlog content is not a valid record list: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Failed to encode backlog: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the backlog file simply does not exist yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// True when the file exists but does not hold a record list (bad JSON or bad UTF-8)
    pub fn is_malformed(&self) -> bool {
        match self {
            StorageError::Malformed(_) => true,
            StorageError::Io { source, .. } => source.kind() == std::io::ErrorKind::InvalidData,
            StorageError::Serialize(_) => false,
        }
    }
}

/// Errors from the host data bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Subscription rejected: {message}")]
    Subscribe { message: String },

    #[error("Query for '{path}' failed: {message}")]
    Query { path: String, message: String },
}
