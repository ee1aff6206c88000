//! Storage abstraction layer.
//!
//! Every backend implements [`StorageAdapter`] for records and
//! [`VectorBackend`] for the vector primitives the search layer needs.

mod file;
mod memory;
pub mod sqlite;
mod traits;

use crate::config::AdapterConfig;
use crate::Result;
use std::sync::Arc;

pub use file::FileAdapter;
pub use memory::MemoryAdapter;
pub use sqlite::pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
pub use sqlite::SqliteAdapter;
pub use traits::{
    cosine_similarity, BatchFailure, BatchOperation, BatchOutcome, BatchReport, CleanupReport,
    Embedder, Embedding, StorageAdapter, VectorBackend,
};

/// A backend that stores both records and vectors.
pub trait Store: StorageAdapter + VectorBackend {
    fn into_adapter(self: Arc<Self>) -> Arc<dyn StorageAdapter>;
    fn into_vectors(self: Arc<Self>) -> Arc<dyn VectorBackend>;
}

impl<T: StorageAdapter + VectorBackend + 'static> Store for T {
    fn into_adapter(self: Arc<Self>) -> Arc<dyn StorageAdapter> {
        self
    }

    fn into_vectors(self: Arc<Self>) -> Arc<dyn VectorBackend> {
        self
    }
}

/// Build the backend `config` selects and initialize it.
pub async fn open_store(config: &AdapterConfig) -> Result<Arc<dyn Store>> {
    config.validate()?;
    let store: Arc<dyn Store> = match config {
        AdapterConfig::Memory(c) => Arc::new(MemoryAdapter::new(c.clone())),
        AdapterConfig::File(c) => Arc::new(FileAdapter::new(c.clone())),
        AdapterConfig::Sqlite(c) => Arc::new(SqliteAdapter::new(c.clone())),
    };
    store.initialize().await?;
    Ok(store)
}

/// Like [`open_store`], for callers that only need record operations.
pub async fn create_adapter(config: &AdapterConfig) -> Result<Arc<dyn StorageAdapter>> {
    Ok(open_store(config).await?.into_adapter())
}
