//! Test utilities for Docstore.
//!
//! Provides reusable record fixtures and adapter constructors.

use crate::config::{FileConfig, SqliteConfig};
use crate::record::DataRecord;
use crate::storage::{FileAdapter, MemoryAdapter, SqliteAdapter, StorageAdapter};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

/// Test fixture for creating sample records.
pub struct TestFixtures;

impl TestFixtures {
    /// A user with a name, age and city.
    pub fn user(id: &str, name: &str, age: u32, city: &str) -> DataRecord {
        DataRecord::new("users", id, json!({ "name": name, "age": age, "city": city }))
    }

    /// A post referencing `author_id`.
    pub fn post(id: &str, author_id: &str, title: &str, likes: u32) -> DataRecord {
        DataRecord::new(
            "posts",
            id,
            json!({ "authorId": author_id, "title": title, "likes": likes }),
        )
    }

    /// Five users across three cities.
    pub fn users() -> Vec<DataRecord> {
        vec![
            Self::user("u1", "Ada", 36, "London"),
            Self::user("u2", "Grace", 45, "New York"),
            Self::user("u3", "Alan", 41, "London"),
            Self::user("u4", "Edsger", 72, "Austin"),
            Self::user("u5", "Barbara", 29, "New York"),
        ]
    }
}

/// Keeps the temp directory of an on-disk adapter alive.
pub struct TestStore {
    pub adapter: Arc<dyn StorageAdapter>,
    _dir: Option<TempDir>,
}

impl TestStore {
    pub async fn memory() -> Self {
        Self {
            adapter: Arc::new(MemoryAdapter::ephemeral()),
            _dir: None,
        }
    }

    pub async fn file() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let adapter = FileAdapter::new(FileConfig {
            base_path: dir.path().to_path_buf(),
            namespace: "test".into(),
        });
        adapter.initialize().await.expect("initialize file adapter");
        Self {
            adapter: Arc::new(adapter),
            _dir: Some(dir),
        }
    }

    pub async fn sqlite() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let adapter = SqliteAdapter::new(SqliteConfig {
            path: dir.path().join("test.db"),
            pool_size: 2,
            health_check_interval_secs: None,
            ..Default::default()
        });
        adapter.initialize().await.expect("initialize sqlite adapter");
        Self {
            adapter: Arc::new(adapter),
            _dir: Some(dir),
        }
    }

    /// One of each backend.
    pub async fn all() -> Vec<Self> {
        vec![Self::memory().await, Self::file().await, Self::sqlite().await]
    }

    /// Insert `records`, panicking on failure.
    pub async fn seed(&self, records: Vec<DataRecord>) {
        for record in records {
            self.adapter.create(record).await.expect("seed record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_fixture() {
        let user = TestFixtures::user("u1", "Ada", 36, "London");
        assert_eq!(user.collection, "users");
        assert_eq!(user.data["name"], "Ada");
        assert_eq!(user.metadata.version, 1);
    }

    #[tokio::test]
    async fn test_every_backend_accepts_seed_data() {
        for store in TestStore::all().await {
            store.seed(TestFixtures::users()).await;
            let stats = store
                .adapter
                .get_collection_stats("users")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stats.record_count, 5, "{}", store.adapter.strategy());
        }
    }
}
