//! Error types for the sync engine.
//!
//! Lower layers return structured results rather than bubbling raw errors:
//! expected business failures (a sale rejected by the backend, a retryable
//! network fault) are values on the outcome types, while these error types
//! cover programmer errors and infrastructure faults.

use thiserror::Error;

/// Errors from the local SQLite store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The local database could not be opened; the engine is running in
    /// network-only mode and every store operation reports this.
    #[error("local store unavailable (network-only mode)")]
    Unavailable,

    #[error("store lock poisoned")]
    Poisoned,

    #[error("{context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A record arrived without a store id. Retrying cannot fix this, so it
    /// fails fast instead of entering the retry bookkeeping.
    #[error("missing store id")]
    MissingStoreId,

    /// An insert collided on a unique key and the conflicting row could not
    /// be located even by full scan.
    #[error("unique key conflict on {context} could not be resolved")]
    UnresolvedConflict { context: &'static str },
}

impl StoreError {
    pub(crate) fn sqlite(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
        move |source| StoreError::Sqlite { context, source }
    }

    pub(crate) fn serialize(context: &'static str) -> impl FnOnce(serde_json::Error) -> StoreError {
        move |source| StoreError::Serialize { context, source }
    }
}

/// A failed remote call: an HTTP-like status (when one was received) plus a
/// human-readable message suitable for sync-error bookkeeping.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A failure with no HTTP status: connect error, timeout, DNS.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Duplicate-unique-key rejection; triggers conflict recovery.
    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// Worth retrying later: network faults, timeouts, backpressure, 5xx.
    /// Unknown failures are treated as transient by default.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(429) => true,
            Some(s) if s >= 500 => true,
            Some(409) => false,
            Some(s) => s < 400,
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("invalid sale: {0}")]
    InvalidSale(String),

    #[error("timed out waiting for in-flight requests to drain")]
    RequestDrainTimeout,

    /// The queue worker went away before the task's result was delivered.
    #[error("queue closed before the task completed")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::new(409, "duplicate invoice number").is_conflict());
        assert!(!RemoteError::new(409, "duplicate invoice number").is_transient());

        assert!(RemoteError::network("connection refused").is_transient());
        assert!(RemoteError::new(503, "server error").is_transient());
        assert!(RemoteError::new(429, "backpressure").is_transient());
        assert!(!RemoteError::new(400, "validation failed").is_transient());
        assert!(!RemoteError::new(404, "not found").is_transient());
    }

    #[test]
    fn test_store_error_messages_carry_context() {
        let err = StoreError::sqlite("insert sale")(rusqlite::Error::InvalidQuery);
        assert!(err.to_string().starts_with("insert sale: "));
    }
}
