//! Process-wide [`DataService`].
//!
//! Nothing is created lazily: every call fails with
//! [`Error::NotInitialized`] until [`initialize`] has run, and again after
//! [`reset`].

use super::{CreateRequest, DataOperations, DataService, OperationContext, UpdateRequest};
use crate::error::{Error, Result};
use crate::query::{QueryOutput, RelationalQuery, StorageQuery};
use crate::record::{CollectionStats, DataRecord};
use crate::storage::StorageAdapter;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

static INSTANCE: RwLock<Option<Arc<DataService>>> = RwLock::new(None);

/// Install the global service, replacing any previous one.
pub fn initialize(
    adapter: Arc<dyn StorageAdapter>,
    context: OperationContext,
) -> Result<Arc<DataService>> {
    context.validate()?;
    let service = Arc::new(DataService::new(adapter, context));
    let mut slot = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        info!("Replacing global data service");
    }
    *slot = Some(Arc::clone(&service));
    info!("Global data service initialized ({})", service.adapter().strategy());
    Ok(service)
}

/// The installed service.
pub fn instance() -> Result<Arc<DataService>> {
    INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::NotInitialized)
}

/// Drop the installed service. The adapter is not closed.
pub fn reset() {
    INSTANCE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

pub fn is_initialized() -> bool {
    instance().is_ok()
}

pub async fn create(request: CreateRequest) -> Result<DataRecord> {
    instance()?.create(request).await
}

pub async fn read(collection: &str, id: &str) -> Result<Option<DataRecord>> {
    instance()?.read(collection, id).await
}

pub async fn query(query: &StorageQuery) -> Result<Vec<DataRecord>> {
    instance()?.query(query).await
}

pub async fn query_relational(query: &RelationalQuery) -> Result<QueryOutput> {
    instance()?.query_relational(query).await
}

pub async fn update(request: UpdateRequest) -> Result<DataRecord> {
    instance()?.update(request).await
}

pub async fn delete(collection: &str, id: &str) -> Result<bool> {
    instance()?.delete(collection, id).await
}

pub async fn list_collections() -> Result<Vec<String>> {
    instance()?.list_collections().await
}

pub async fn get_collection_stats(collection: &str) -> Result<Option<CollectionStats>> {
    instance()?.get_collection_stats(collection).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;
    use serde_json::json;

    // Single test: the global slot is shared by every test in the binary.
    #[tokio::test]
    async fn test_global_lifecycle() {
        reset();
        assert!(matches!(
            read("users", "u1").await.unwrap_err(),
            Error::NotInitialized
        ));
        assert!(matches!(
            create(CreateRequest::new("users", json!({}))).await.unwrap_err(),
            Error::NotInitialized
        ));

        let bad = OperationContext {
            session_id: String::new(),
            timestamp: None,
            user_id: None,
        };
        assert!(initialize(Arc::new(MemoryAdapter::ephemeral()), bad).is_err());
        assert!(!is_initialized());

        initialize(
            Arc::new(MemoryAdapter::ephemeral()),
            OperationContext::new("global-test"),
        )
        .unwrap();
        let created = create(CreateRequest::new("users", json!({"name": "Ada"})).with_id("u1"))
            .await
            .unwrap();
        assert_eq!(created.metadata.version, 1);
        let updated = update(UpdateRequest::new("users", "u1", json!({"name": "Ada L"})))
            .await
            .unwrap();
        assert_eq!(updated.metadata.version, 2);
        assert_eq!(list_collections().await.unwrap(), vec!["users"]);
        assert!(delete("users", "u1").await.unwrap());
        assert!(read("users", "u1").await.unwrap().is_none());

        reset();
        assert!(matches!(instance().unwrap_err(), Error::NotInitialized));
    }
}
