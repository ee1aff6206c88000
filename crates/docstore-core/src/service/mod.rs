//! Context-validated façade over a single storage adapter.

pub mod global;
pub mod models;

use crate::error::{Error, Result};
use crate::query::{QueryOutput, RelationalQuery, StorageQuery};
use crate::record::{validate_collection_name, CollectionStats, DataRecord, RecordMetadata};
use crate::storage::StorageAdapter;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
pub use models::*;

/// The operations the façade exposes, both as an instance and globally.
#[async_trait]
pub trait DataOperations: Send + Sync {
    /// Validate and insert; assigns an id when the request has none.
    async fn create(&self, request: CreateRequest) -> Result<DataRecord>;

    async fn read(&self, collection: &str, id: &str) -> Result<Option<DataRecord>>;

    async fn query(&self, query: &StorageQuery) -> Result<Vec<DataRecord>>;

    async fn query_relational(&self, query: &RelationalQuery) -> Result<QueryOutput>;

    /// Validate and shallow-merge into an existing record.
    ///
    /// The context timestamp must be present but is not written:
    /// `updatedAt` always comes from the adapter's clock at commit time.
    async fn update(&self, request: UpdateRequest) -> Result<DataRecord>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn get_collection_stats(&self, collection: &str) -> Result<Option<CollectionStats>>;
}

/// One adapter plus the context every write is checked against.
#[derive(Clone)]
pub struct DataService {
    adapter: Arc<dyn StorageAdapter>,
    context: OperationContext,
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl DataService {
    pub fn new(adapter: Arc<dyn StorageAdapter>, context: OperationContext) -> Self {
        Self { adapter, context }
    }

    /// Same adapter, different caller.
    pub fn with_context(&self, context: OperationContext) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            context,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }
}

fn require_collection(collection: &str) -> Result<()> {
    if collection.trim().is_empty() {
        return Err(Error::Validation("collection must not be empty".into()));
    }
    validate_collection_name(collection)
}

fn require_data(data: &Value) -> Result<()> {
    if data.is_null() {
        return Err(Error::Validation("data must not be null".into()));
    }
    Ok(())
}

#[async_trait]
impl DataOperations for DataService {
    async fn create(&self, request: CreateRequest) -> Result<DataRecord> {
        require_collection(&request.collection)?;
        require_data(&request.data)?;
        let now = self.context.validate()?;

        let id = match request.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let mut metadata = RecordMetadata::new(now);
        metadata.tags = request.tags;
        metadata.ttl = request.ttl;
        let record = DataRecord {
            id,
            collection: request.collection,
            data: request.data,
            metadata,
        };
        debug!(
            "Session {} creating {}/{}",
            self.context.session_id, record.collection, record.id
        );
        self.adapter.create(record).await
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<DataRecord>> {
        require_collection(collection)?;
        self.adapter.read(collection, id).await
    }

    async fn query(&self, query: &StorageQuery) -> Result<Vec<DataRecord>> {
        require_collection(&query.collection)?;
        self.adapter.query(query).await
    }

    async fn query_relational(&self, query: &RelationalQuery) -> Result<QueryOutput> {
        self.adapter.query_relational(query).await
    }

    async fn update(&self, request: UpdateRequest) -> Result<DataRecord> {
        require_collection(&request.collection)?;
        require_data(&request.data)?;
        let requested_at = self.context.validate()?;
        debug!(
            "Session {} updating {}/{} (requested at {})",
            self.context.session_id, request.collection, request.id, requested_at
        );
        self.adapter
            .update(&request.collection, &request.id, request.data, request.increment_version)
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        require_collection(collection)?;
        self.context.validate()?;
        self.adapter.delete(collection, id).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.adapter.list_collections().await
    }

    async fn get_collection_stats(&self, collection: &str) -> Result<Option<CollectionStats>> {
        self.adapter.get_collection_stats(collection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::QueryBuilder;
    use crate::query::SortDirection;
    use crate::storage::MemoryAdapter;
    use crate::testutils::{TestFixtures, TestStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn service() -> DataService {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        DataService::new(
            Arc::new(MemoryAdapter::ephemeral()),
            OperationContext::new("session-1").at(at),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_stamps_context_time() {
        let svc = service();
        let record = svc
            .create(CreateRequest::new("users", json!({"name": "Ada"})))
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&record.id).is_ok());
        assert_eq!(record.metadata.version, 1);
        assert_eq!(record.metadata.created_at, svc.context().timestamp.unwrap());
        assert_eq!(record.metadata.created_at, record.metadata.updated_at);

        let explicit = svc
            .create(CreateRequest::new("users", json!({})).with_id("u1"))
            .await
            .unwrap();
        assert_eq!(explicit.id, "u1");
    }

    #[tokio::test]
    async fn test_writes_are_validated_before_reaching_storage() {
        let svc = service();
        let err = svc.create(CreateRequest::new("", json!({}))).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = svc
            .create(CreateRequest::new("users", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let anonymous = svc.with_context(OperationContext {
            session_id: " ".into(),
            timestamp: Some(Utc::now()),
            user_id: None,
        });
        let err = anonymous
            .create(CreateRequest::new("users", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("session id"));

        let timeless = svc.with_context(OperationContext {
            session_id: "s".into(),
            timestamp: None,
            user_id: None,
        });
        assert!(timeless.delete("users", "u1").await.is_err());
        assert!(svc.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_stamps_adapter_clock_not_context_time() {
        let svc = service();
        let created = svc
            .create(CreateRequest::new("users", json!({"name": "Ada"})).with_id("u1"))
            .await
            .unwrap();
        let before = Utc::now();
        let updated = svc
            .update(UpdateRequest::new("users", "u1", json!({"age": 36})))
            .await
            .unwrap();
        assert_eq!(updated.metadata.created_at, created.metadata.created_at);
        assert!(updated.metadata.updated_at >= before);
        assert_ne!(updated.metadata.updated_at, svc.context().timestamp.unwrap());
        assert_eq!(updated.metadata.version, 2);

        let timeless = svc.with_context(OperationContext {
            session_id: "s".into(),
            timestamp: None,
            user_id: None,
        });
        let err = timeless
            .update(UpdateRequest::new("users", "u1", json!({"age": 37})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[tokio::test]
    async fn test_same_results_on_every_backend() {
        for store in TestStore::all().await {
            let name = store.adapter.strategy();
            store.seed(TestFixtures::users()).await;
            store
                .seed(vec![
                    TestFixtures::post("p1", "u1", "Notes on the engine", 12),
                    TestFixtures::post("p2", "u3", "Computing machinery", 40),
                ])
                .await;
            let svc = DataService::new(Arc::clone(&store.adapter), OperationContext::new("s1"));

            let updated = svc
                .update(UpdateRequest::new("posts", "p1", json!({"likes": 13})))
                .await
                .unwrap();
            assert_eq!(updated.data["likes"], json!(13), "{}", name);
            assert_eq!(updated.data["title"], json!("Notes on the engine"), "{}", name);

            let q = QueryBuilder::new()
                .from("posts")
                .inner_join("users", "authorId", "id")
                .alias("author")
                .order_by("likes", SortDirection::Desc)
                .build()
                .unwrap();
            let out = svc.query_relational(&q).await.unwrap();
            assert_eq!(out.records.len(), 2, "{}", name);
            assert_eq!(out.records[0].data["author"]["name"], json!("Alan"), "{}", name);
            assert_eq!(out.records[1].data["author"]["name"], json!("Ada"), "{}", name);

            assert!(svc.delete("posts", "p2").await.unwrap(), "{}", name);
            let stats = svc.get_collection_stats("posts").await.unwrap().unwrap();
            assert_eq!(stats.record_count, 1, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_missing_record_is_an_error() {
        let svc = service();
        let err = svc
            .update(UpdateRequest::new("users", "ghost", json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!svc.delete("users", "ghost").await.unwrap());
    }
}
