//! In-memory storage backend with optional JSON snapshots.

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::query::{eval, QueryExplanation, QueryOutput, RelationalQuery};
use crate::record::{
    validate_collection_name, validate_record_id, CollectionStats, DataRecord, StoredVector,
};
use crate::storage::traits::{CleanupReport, StorageAdapter, VectorBackend};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Bucket<T> = HashMap<String, HashMap<String, T>>;

/// Everything the memory backend holds; also the snapshot file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    collections: Bucket<DataRecord>,
    #[serde(default)]
    vectors: Bucket<StoredVector>,
}

/// Two-level map storage: collection → id → record.
pub struct MemoryAdapter {
    config: MemoryConfig,
    state: Arc<RwLock<MemoryState>>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryAdapter {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(MemoryState::default())),
            snapshot_task: Mutex::new(None),
        }
    }

    /// Pure in-memory store without snapshots.
    pub fn ephemeral() -> Self {
        Self::new(MemoryConfig::default())
    }

    /// Write the current contents to the snapshot file, if configured.
    pub async fn snapshot(&self) -> Result<()> {
        match &self.config.snapshot_path {
            Some(path) => write_snapshot(&self.state, path).await,
            None => Ok(()),
        }
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(Error::poisoned)
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(Error::poisoned)
    }

    fn load_snapshot(path: &Path) -> MemoryState {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", path.display());
                return MemoryState::default();
            }
            Err(e) => {
                warn!("Cannot read snapshot {}: {}; starting empty", path.display(), e);
                return MemoryState::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("Corrupt snapshot {}: {}; starting empty", path.display(), e);
                MemoryState::default()
            }
        }
    }

    fn collection_records(&self, collection: &str) -> Result<Vec<DataRecord>> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default())
    }
}

async fn write_snapshot(state: &RwLock<MemoryState>, path: &Path) -> Result<()> {
    let bytes = {
        let guard = state.read().map_err(Error::poisoned)?;
        serde_json::to_vec_pretty(&*guard)?
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("Snapshot written to {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn strategy(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        let Some(path) = self.config.snapshot_path.clone() else {
            return Ok(());
        };
        let mut task = self.snapshot_task.lock().map_err(Error::poisoned)?;
        if task.is_some() {
            return Ok(());
        }

        let restored = Self::load_snapshot(&path);
        let count: usize = restored.collections.values().map(HashMap::len).sum();
        *self.write_state()? = restored;
        info!("Memory store initialized from {} ({} records)", path.display(), count);

        if self.config.snapshot_interval_secs > 0 {
            let state = Arc::clone(&self.state);
            let period = Duration::from_secs(self.config.snapshot_interval_secs);
            *task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = write_snapshot(&state, &path).await {
                        warn!("Periodic snapshot failed: {}", e);
                    }
                }
            }));
        }
        Ok(())
    }

    async fn create(&self, record: DataRecord) -> Result<DataRecord> {
        validate_collection_name(&record.collection)?;
        validate_record_id(&record.id)?;
        let mut state = self.write_state()?;
        let bucket = state.collections.entry(record.collection.clone()).or_default();
        if bucket.contains_key(&record.id) {
            return Err(Error::AlreadyExists {
                collection: record.collection,
                id: record.id,
            });
        }
        bucket.insert(record.id.clone(), record.clone());
        debug!("Created {}/{}", record.collection, record.id);
        Ok(record)
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<DataRecord>> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .and_then(|bucket| bucket.get(id))
            .cloned())
    }

    async fn query_relational(&self, query: &RelationalQuery) -> Result<QueryOutput> {
        let primary = self.collection_records(&query.collection)?;
        let mut joined = HashMap::new();
        for join in &query.joins {
            joined.insert(join.collection.clone(), self.collection_records(&join.collection)?);
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
        let mut state = self.write_state()?;
        let record = state
            .collections
            .get_mut(collection)
            .and_then(|bucket| bucket.get_mut(id))
            .ok_or_else(|| Error::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        record.apply_patch(patch, increment_version, Utc::now());
        Ok(record.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut state = self.write_state()?;
        let removed = match state.collections.get_mut(collection) {
            Some(bucket) => {
                let removed = bucket.remove(id).is_some();
                if bucket.is_empty() {
                    state.collections.remove(collection);
                }
                removed
            }
            None => false,
        };
        if let Some(vectors) = state.vectors.get_mut(collection) {
            vectors.remove(id);
        }
        Ok(removed)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.read_state()?.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_collection_stats(&self, collection: &str) -> Result<Option<CollectionStats>> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .map(|bucket| CollectionStats::from_records(collection, bucket.values())))
    }

    async fn clear(&self) -> Result<()> {
        self.write_state()?.collections.clear();
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut state = self.write_state()?;
        state.collections.clear();
        state.vectors.clear();
        Ok(())
    }

    async fn truncate(&self, collection: &str) -> Result<usize> {
        Ok(self
            .write_state()?
            .collections
            .remove(collection)
            .map_or(0, |bucket| bucket.len()))
    }

    async fn cleanup(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        let mut state = self.write_state()?;
        for bucket in state.collections.values_mut() {
            let before = bucket.len();
            bucket.retain(|_, r| !r.metadata.is_expired(now));
            report.expired_records += before - bucket.len();
        }
        let before = state.collections.len();
        state.collections.retain(|_, bucket| !bucket.is_empty());
        report.empty_collections_pruned = before - state.collections.len();
        if report.expired_records > 0 {
            info!("Cleanup removed {} expired records", report.expired_records);
        }
        Ok(report)
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.snapshot_task.lock().map_err(Error::poisoned)?.take() {
            task.abort();
        }
        self.snapshot().await
    }

    async fn explain_query(&self, query: &RelationalQuery) -> Result<QueryExplanation> {
        query.validate()?;
        let rows = self
            .read_state()?
            .collections
            .get(&query.collection)
            .map_or(0, HashMap::len);
        let mut plan = vec![format!("SCAN bucket {} ({} records)", query.collection, rows)];
        for join in &query.joins {
            plan.push(format!("NESTED LOOP {:?} JOIN {} AS {}", join.join_type, join.collection, join.alias()));
        }
        if query.filter.is_some() {
            plan.push("FILTER in memory".to_string());
        }
        if query.is_aggregate() {
            plan.push(format!("GROUP BY {:?}", query.group_by));
        }
        Ok(QueryExplanation {
            backend: self.strategy().to_string(),
            query: serde_json::to_string(query)?,
            parameters: Vec::new(),
            plan,
            estimated_rows: Some(rows),
        })
    }
}

#[async_trait]
impl VectorBackend for MemoryAdapter {
    async fn ensure_vector_storage(&self, collection: &str, _dimensions: usize) -> Result<()> {
        validate_collection_name(collection)?;
        self.write_state()?
            .vectors
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn store_vector(&self, collection: &str, vector: &StoredVector) -> Result<()> {
        self.write_state()?
            .vectors
            .entry(collection.to_string())
            .or_default()
            .insert(vector.record_id.clone(), vector.clone());
        Ok(())
    }

    async fn get_all_vectors(&self, collection: &str) -> Result<Vec<StoredVector>> {
        let mut vectors: Vec<StoredVector> = self
            .read_state()?
            .vectors
            .get(collection)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default();
        vectors.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(vectors)
    }

    async fn get_vector_count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .read_state()?
            .vectors
            .get(collection)
            .map_or(0, HashMap::len))
    }

    async fn delete_vector(&self, collection: &str, record_id: &str) -> Result<bool> {
        Ok(self
            .write_state()?
            .vectors
            .get_mut(collection)
            .map_or(false, |b| b.remove(record_id).is_some()))
    }
}
