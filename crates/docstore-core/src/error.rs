//! Error types for Docstore.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Docstore error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before touching storage
    #[error("Validation error: {0}")]
    Validation(String),

    /// `create` on an existing `(collection, id)` pair
    #[error("Record already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    /// `update` on a missing record
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backend operation failed on a specific key
    #[error("{operation} failed for {key}: {source}")]
    Persistence {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// Malformed query or unsafe identifier
    #[error("Query error: {0}")]
    Query(String),

    /// The connection pool has been closed
    #[error("Connection pool is closed")]
    PoolClosed,

    /// No connection became available within the configured wait
    #[error("Timed out after {0}ms waiting for a pooled connection")]
    PoolTimeout(u64),

    /// Embedding error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Embedding worker transport error
    #[error("Worker error: {0}")]
    Worker(String),

    /// Global service used before `initialize`
    #[error("Data service not initialized: call global::initialize first")]
    NotInitialized,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wrap an error with the operation and key that failed.
    pub fn persistence(operation: &'static str, key: impl Into<String>, source: Error) -> Self {
        Error::Persistence {
            operation,
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Error for a poisoned lock.
    pub(crate) fn poisoned<T>(_: T) -> Self {
        Error::Other(anyhow::anyhow!("internal lock poisoned"))
    }

    /// True for the not-found variant, including when wrapped.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Persistence { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
