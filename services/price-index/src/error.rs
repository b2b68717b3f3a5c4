//! Error taxonomy for the price index pipeline
//!
//! Failures are scoped to the unit of work that produced them: one row
//! (`types::errors::ValidationError`), one source (`SourceError`), one cache
//! call (`CacheError`), one connection (`BroadcastError`). Only
//! `IngestError::StoreUnavailable` is allowed to reach the scheduler as a
//! fatal condition.

use thiserror::Error;

/// Snapshot store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),

    #[error("journal I/O error: {0}")]
    Io(String),

    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// A whole adapter call failed. Isolated to that source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    #[error("source {source_id} timed out after {timeout_ms}ms")]
    Timeout { source_id: String, timeout_ms: u64 },

    #[error("malformed payload from source {source_id}: {reason}")]
    Malformed { source_id: String, reason: String },
}

impl SourceError {
    pub fn source_id(&self) -> &str {
        match self {
            SourceError::Unavailable { source_id, .. }
            | SourceError::Timeout { source_id, .. }
            | SourceError::Malformed { source_id, .. } => source_id,
        }
    }
}

/// Batch-level ingestion failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("source failed: {0}")]
    Source(#[from] SourceError),

    #[error("snapshot store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Cache backend failures. Never surfaced to query callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend timed out after {0}ms")]
    Timeout(u64),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// Delivery failure for one connection. Only that connection is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("outbound queue overflow for connection {connection_id} (capacity {capacity})")]
    QueueOverflow { connection_id: u64, capacity: usize },

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("send to connection {connection_id} timed out after {timeout_ms}ms")]
    SendTimeout { connection_id: u64, timeout_ms: u64 },
}

/// Channel authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication is not configured")]
    NotConfigured,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("authentication handshake timed out")]
    Timeout,
}

/// Startup failures of the service wiring.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("store initialization failed: {0}")]
    Store(#[from] StoreError),

    #[error("cache initialization failed: {0}")]
    Cache(#[from] CacheError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_from_store_error() {
        let err: IngestError = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(err, IngestError::StoreUnavailable(_)));
        assert_eq!(err.to_string(), "snapshot store unavailable: snapshot store unavailable: down");
    }

    #[test]
    fn test_source_error_id() {
        let err = SourceError::Timeout {
            source_id: "cardmarket".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.source_id(), "cardmarket");
        assert!(err.to_string().contains("500ms"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: StoreError = io.into();
        assert_eq!(err, StoreError::Io("disk gone".to_string()));
    }
}
