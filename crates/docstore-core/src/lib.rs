//! Docstore Core Library
//!
//! Record model, pluggable storage adapters (memory, file, SQLite), the
//! relational query engine, vector search, migration between backends and
//! a context-validated service façade.

pub mod config;
pub mod error;
pub mod migration;
pub mod query;
pub mod record;
pub mod service;
pub mod storage;
pub mod vector;

#[cfg(test)]
pub mod testutils;

pub use config::AdapterConfig;
pub use error::{Error, Result};
pub use record::{DataRecord, RecordMetadata, StorageResult};
pub use service::global;
pub use storage::{create_adapter, open_store, StorageAdapter};
