//! Storage trait definitions.

use crate::query::{QueryExplanation, QueryOutput, RelationalQuery, StorageQuery};
use crate::record::{CollectionStats, DataRecord, StoredVector};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// The vector data
    pub vector: Vec<f32>,
    /// Model used to generate this embedding
    pub model_id: String,
    /// Dimensions
    pub dimensions: usize,
}

impl Embedding {
    /// Create a new embedding.
    pub fn new(vector: Vec<f32>, model_id: String) -> Self {
        let dimensions = vector.len();
        Self {
            vector,
            model_id,
            dimensions,
        }
    }

    /// Compute cosine similarity with another embedding.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }
}

/// `dot(a, b) / (|a| * |b|)`; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// One step of a heterogeneous batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum BatchOperation {
    Create {
        record: DataRecord,
    },
    Read {
        collection: String,
        id: String,
    },
    Update {
        collection: String,
        id: String,
        data: Value,
        #[serde(default = "default_true", rename = "incrementVersion")]
        increment_version: bool,
    },
    Delete {
        collection: String,
        id: String,
    },
}

fn default_true() -> bool {
    true
}

impl BatchOperation {
    /// `collection/id` the step targets.
    pub fn key(&self) -> String {
        match self {
            BatchOperation::Create { record } => format!("{}/{}", record.collection, record.id),
            BatchOperation::Read { collection, id }
            | BatchOperation::Update { collection, id, .. }
            | BatchOperation::Delete { collection, id } => format!("{}/{}", collection, id),
        }
    }

    /// Run this step against any adapter.
    pub async fn apply(self, adapter: &(impl StorageAdapter + ?Sized)) -> Result<BatchOutcome> {
        Ok(match self {
            BatchOperation::Create { record } => BatchOutcome::Created(adapter.create(record).await?),
            BatchOperation::Read { collection, id } => {
                BatchOutcome::Read(adapter.read(&collection, &id).await?)
            }
            BatchOperation::Update {
                collection,
                id,
                data,
                increment_version,
            } => BatchOutcome::Updated(
                adapter
                    .update(&collection, &id, data, increment_version)
                    .await?,
            ),
            BatchOperation::Delete { collection, id } => {
                BatchOutcome::Deleted(adapter.delete(&collection, &id).await?)
            }
        })
    }
}

/// Result of one successful batch step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "result", rename_all = "lowercase")]
pub enum BatchOutcome {
    Created(DataRecord),
    Read(Option<DataRecord>),
    Updated(DataRecord),
    Deleted(bool),
}

/// The step that stopped a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub index: usize,
    pub key: String,
    pub error: String,
}

/// Outcome of [`StorageAdapter::batch`].
///
/// Sequential backends report every step completed before the failure;
/// the transactional SQLite backend rolls back and reports none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<BatchOutcome>,
    pub failure: Option<BatchFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// What a maintenance sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub expired_records: usize,
    pub empty_collections_pruned: usize,
    pub temp_files_removed: usize,
}

/// The contract every storage backend satisfies.
///
/// Not-found conventions: `read` yields `Ok(None)`, `update` fails with
/// [`crate::Error::NotFound`], `delete` yields `Ok(false)`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name (`memory`, `file`, `sqlite`).
    fn strategy(&self) -> &'static str;

    /// Prepare the backend. Safe to call more than once.
    async fn initialize(&self) -> Result<()>;

    /// Insert a new record; fails if `(collection, id)` exists.
    async fn create(&self, record: DataRecord) -> Result<DataRecord>;

    /// Fetch one record.
    async fn read(&self, collection: &str, id: &str) -> Result<Option<DataRecord>>;

    /// Run a simple query.
    async fn query(&self, query: &StorageQuery) -> Result<Vec<DataRecord>> {
        let relational: RelationalQuery = query.clone().into();
        Ok(self.query_relational(&relational).await?.records)
    }

    /// Run a relational query (filter tree, joins, grouping).
    async fn query_relational(&self, query: &RelationalQuery) -> Result<QueryOutput>;

    /// Shallow-merge `patch` into an existing record.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
        increment_version: bool,
    ) -> Result<DataRecord>;

    /// Remove a record; `Ok(false)` when there was nothing to delete.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Names of all known collections, sorted.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Stats for one collection, `None` if unknown.
    async fn get_collection_stats(&self, collection: &str) -> Result<Option<CollectionStats>>;

    /// Run heterogeneous operations in order, stopping at the first failure.
    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for (index, op) in operations.into_iter().enumerate() {
            let key = op.key();
            match op.apply(self).await {
                Ok(outcome) => report.results.push(outcome),
                Err(e) => {
                    tracing::warn!("Batch step {} ({}) failed: {}", index, key, e);
                    report.failure = Some(BatchFailure {
                        index,
                        key,
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Remove every record, keeping collection registrations.
    async fn clear(&self) -> Result<()>;

    /// Remove every record, collection and stored vector.
    async fn clear_all(&self) -> Result<()>;

    /// Remove every record of one collection; returns how many went.
    async fn truncate(&self, collection: &str) -> Result<usize>;

    /// Maintenance sweep (TTL expiry and backend housekeeping).
    async fn cleanup(&self) -> Result<CleanupReport>;

    /// Release resources; the adapter is unusable afterwards.
    async fn close(&self) -> Result<()>;

    /// Describe how a query would run without running it.
    async fn explain_query(&self, query: &RelationalQuery) -> Result<QueryExplanation>;
}

/// Backend-specific vector primitives the search layer composes over.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Make sure vectors of `dimensions` can be stored for `collection`.
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> Result<()>;

    /// Insert or replace the vector for `vector.record_id`.
    async fn store_vector(&self, collection: &str, vector: &StoredVector) -> Result<()>;

    /// Every stored vector of a collection.
    async fn get_all_vectors(&self, collection: &str) -> Result<Vec<StoredVector>>;

    /// Number of stored vectors in a collection.
    async fn get_vector_count(&self, collection: &str) -> Result<usize>;

    /// Remove one record's vector; `Ok(false)` if none was stored.
    async fn delete_vector(&self, collection: &str, record_id: &str) -> Result<bool>;
}

/// Trait for generating text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generate embeddings for multiple texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}
