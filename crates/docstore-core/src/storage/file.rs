//! JSON-file-per-record storage backend.
//!
//! Layout: `{base_path}/{namespace}/{collection}/{id}.json`. Vectors live
//! under the reserved `_vectors` directory next to the collections.
//! Single-writer discipline is assumed; there is no cross-process locking.

use crate::config::FileConfig;
use crate::error::{Error, Result};
use crate::query::{eval, QueryExplanation, QueryOutput, RelationalQuery};
use crate::record::{
    validate_collection_name, validate_record_id, CollectionStats, DataRecord, StoredVector,
};
use crate::storage::traits::{CleanupReport, StorageAdapter, VectorBackend};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const VECTOR_DIR: &str = "_vectors";

/// Filesystem-backed storage.
pub struct FileAdapter {
    root: PathBuf,
}

impl FileAdapter {
    pub fn new(config: FileConfig) -> Self {
        Self { root: config.root() }
    }

    /// `{base_path}/{namespace}`
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    fn record_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        validate_collection_name(collection)?;
        validate_record_id(id)?;
        Ok(self.collection_dir(collection).join(format!("{}.json", id)))
    }

    fn vector_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        validate_collection_name(collection)?;
        validate_record_id(id)?;
        Ok(self
            .root
            .join(VECTOR_DIR)
            .join(collection)
            .join(format!("{}.json", id)))
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<DataRecord>> {
        validate_collection_name(collection)?;
        load_dir(&self.collection_dir(collection)).await
    }

    async fn collection_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_collection_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove every record file in a collection directory.
    async fn remove_records(&self, collection: &str) -> Result<usize> {
        let dir = self.collection_dir(collection);
        let mut removed = 0;
        for path in json_files(&dir).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

/// Write `value` to `path` through a sibling `.tmp` file and a rename.
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Parse every `*.json` in `dir`, skipping files that do not parse.
async fn load_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for path in json_files(dir).await? {
        match read_json::<T>(&path).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable file {}: {}", path.display(), e),
        }
    }
    Ok(items)
}

#[async_trait]
impl StorageAdapter for FileAdapter {
    fn strategy(&self) -> &'static str {
        "file"
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::persistence("initialize", self.root.display().to_string(), e.into()))?;
        info!("File store initialized at {}", self.root.display());
        Ok(())
    }

    async fn create(&self, record: DataRecord) -> Result<DataRecord> {
        let path = self.record_path(&record.collection, &record.id)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::AlreadyExists {
                collection: record.collection,
                id: record.id,
            });
        }
        write_atomic(&path, &record).await.map_err(|e| {
            Error::persistence("create", format!("{}/{}", record.collection, record.id), e)
        })?;
        debug!("Created {}", path.display());
        Ok(record)
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<DataRecord>> {
        let path = self.record_path(collection, id)?;
        read_json(&path)
            .await
            .map_err(|e| Error::persistence("read", format!("{}/{}", collection, id), e))
    }

    async fn query_relational(&self, query: &RelationalQuery) -> Result<QueryOutput> {
        let primary = self.load_collection(&query.collection).await?;
        let mut joined = HashMap::new();
        for join in &query.joins {
            joined.insert(join.collection.clone(), self.load_collection(&join.collection).await?);
        }
        let mut output = eval::execute(query, primary, &joined)?;
        if query.explain {
            output.explanation = Some(self.explain_query(query).await?);
        }
        Ok(output)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
        increment_version: bool,
    ) -> Result<DataRecord> {
        let path = self.record_path(collection, id)?;
        let key = format!("{}/{}", collection, id);
        let mut record: DataRecord = read_json(&path)
            .await
            .map_err(|e| Error::persistence("update", key.clone(), e))?
            .ok_or_else(|| Error::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        record.apply_patch(patch, increment_version, Utc::now());
        write_atomic(&path, &record)
            .await
            .map_err(|e| Error::persistence("update", key, e))?;
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let path = self.record_path(collection, id)?;
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                return Err(Error::persistence(
                    "delete",
                    format!("{}/{}", collection, id),
                    e.into(),
                ))
            }
        };
        self.delete_vector(collection, id).await?;
        Ok(removed)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.collection_names().await
    }

    async fn get_collection_stats(&self, collection: &str) -> Result<Option<CollectionStats>> {
        validate_collection_name(collection)?;
        if !tokio::fs::try_exists(self.collection_dir(collection)).await? {
            return Ok(None);
        }
        let records = self.load_collection(collection).await?;
        Ok(Some(CollectionStats::from_records(collection, records.iter())))
    }

    async fn clear(&self) -> Result<()> {
        for name in self.collection_names().await? {
            self.remove_records(&name).await?;
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn truncate(&self, collection: &str) -> Result<usize> {
        validate_collection_name(collection)?;
        self.remove_records(collection).await
    }

    async fn cleanup(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        for name in self.collection_names().await? {
            let dir = self.collection_dir(&name);
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    tokio::fs::remove_file(&path).await?;
                    report.temp_files_removed += 1;
                }
            }
            for record in self.load_collection(&name).await? {
                if record.metadata.is_expired(now) && self.delete(&name, &record.id).await? {
                    report.expired_records += 1;
                }
            }
        }
        if report.expired_records + report.temp_files_removed > 0 {
            info!(
                "Cleanup removed {} expired records and {} temp files",
                report.expired_records, report.temp_files_removed
            );
        }
        Ok(report)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn explain_query(&self, query: &RelationalQuery) -> Result<QueryExplanation> {
        query.validate()?;
        let dir = self.collection_dir(&query.collection);
        let files = json_files(&dir).await?.len();
        let mut plan = vec![format!("DIRECTORY SCAN {} ({} files)", dir.display(), files)];
        for join in &query.joins {
            plan.push(format!(
                "DIRECTORY SCAN {} for {:?} JOIN",
                self.collection_dir(&join.collection).display(),
                join.join_type
            ));
        }
        plan.push("PARSE, FILTER, SORT and PAGINATE in memory".to_string());
        Ok(QueryExplanation {
            backend: self.strategy().to_string(),
            query: serde_json::to_string(query)?,
            parameters: Vec::new(),
            plan,
            estimated_rows: Some(files),
        })
    }
}

#[async_trait]
impl VectorBackend for FileAdapter {
    async fn ensure_vector_storage(&self, collection: &str, _dimensions: usize) -> Result<()> {
        validate_collection_name(collection)?;
        tokio::fs::create_dir_all(self.root.join(VECTOR_DIR).join(collection)).await?;
        Ok(())
    }

    async fn store_vector(&self, collection: &str, vector: &StoredVector) -> Result<()> {
        let path = self.vector_path(collection, &vector.record_id)?;
        write_atomic(&path, vector).await
    }

    async fn get_all_vectors(&self, collection: &str) -> Result<Vec<StoredVector>> {
        validate_collection_name(collection)?;
        let mut vectors: Vec<StoredVector> =
            load_dir(&self.root.join(VECTOR_DIR).join(collection)).await?;
        vectors.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(vectors)
    }

    async fn get_vector_count(&self, collection: &str) -> Result<usize> {
        validate_collection_name(collection)?;
        Ok(json_files(&self.root.join(VECTOR_DIR).join(collection))
            .await?
            .len())
    }

    async fn delete_vector(&self, collection: &str, record_id: &str) -> Result<bool> {
        let path = self.vector_path(collection, record_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::StorageQuery;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> FileAdapter {
        let adapter = FileAdapter::new(FileConfig {
            base_path: dir.path().to_path_buf(),
            namespace: "test".to_string(),
        });
        adapter.initialize().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_layout_is_one_pretty_file_per_record() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("users", "u1", json!({"name": "Ada"})))
            .await
            .unwrap();
        let path = dir.path().join("test").join("users").join("u1.json");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains('\n'), "record file should be pretty-printed");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_unparsable_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("users", "u1", json!({"name": "Ada"})))
            .await
            .unwrap();
        std::fs::write(dir.path().join("test/users/broken.json"), b"{oops").unwrap();
        let records = adapter.query(&StorageQuery::new("users")).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_directories() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("b", "1", json!({})))
            .await
            .unwrap();
        adapter
            .create(DataRecord::new("a", "1", json!({})))
            .await
            .unwrap();
        adapter.ensure_vector_storage("a", 3).await.unwrap();
        assert_eq!(adapter.list_collections().await.unwrap(), vec!["a", "b"]);

        // Emptied collections remain listed.
        adapter.delete("a", "1").await.unwrap();
        assert_eq!(adapter.list_collections().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("users", "u1", json!({})))
            .await
            .unwrap();
        std::fs::write(dir.path().join("test/users/u2.json.tmp"), b"partial").unwrap();
        let report = adapter.cleanup().await.unwrap();
        assert_eq!(report.temp_files_removed, 1);
        assert!(adapter.read("users", "u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal_ids() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        let result = adapter
            .create(DataRecord::new("users", "../escape", json!({})))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
