//! Docstore Embeddings Library
//!
//! Embedding generation for vector search: a client for the external
//! embedding worker and, with the `local` feature, an in-process fastembed
//! model. Both implement [`docstore_core::storage::Embedder`].

#[cfg(unix)]
pub mod client;
#[cfg(feature = "local")]
pub mod local;
pub mod protocol;

#[cfg(unix)]
pub use client::{ConnectionState, WorkerClient, WorkerConfig};
#[cfg(feature = "local")]
pub use local::LocalEmbedder;
pub use protocol::{Command, Request, Response};
