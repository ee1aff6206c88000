//! Copy every collection from one backend to another.
//!
//! A migration is planned first ([`MigrationService::plan`]) and then
//! executed. Execution optionally snapshots the source, then streams each
//! collection page by page into the target. Per-record problems are
//! collected in [`MigrationResult::errors`]; they never abort the run.

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::query::StorageQuery;
use crate::record::DataRecord;
use crate::storage::{create_adapter, StorageAdapter};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Migration knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationOptions {
    /// Count what would move without writing anything
    pub dry_run: bool,
    /// Skip structurally invalid records instead of writing them
    pub validate_data: bool,
    /// Snapshot the source before migrating
    pub backup_data: bool,
    /// Records fetched from the source per page
    pub batch_size: usize,
    pub backup_root: PathBuf,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            validate_data: true,
            backup_data: true,
            batch_size: 10_000,
            backup_root: PathBuf::from(".docstore/backups"),
        }
    }
}

/// What [`MigrationService::execute`] will do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub from_strategy: String,
    pub to_strategy: String,
    pub collections: Vec<String>,
    pub dry_run: bool,
    pub validate_data: bool,
    pub backup_data: bool,
}

/// One record (or collection) that did not make it across.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationError {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub message: String,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    /// True only when `errors` is empty
    pub success: bool,
    pub records_migrated: usize,
    pub collections_processed: usize,
    pub errors: Vec<MigrationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub duration_ms: u64,
}

/// Moves records from `source` to `target`.
pub struct MigrationService {
    source: Arc<dyn StorageAdapter>,
    target: Arc<dyn StorageAdapter>,
    source_path: Option<PathBuf>,
    options: MigrationOptions,
}

impl MigrationService {
    pub fn new(
        source: Arc<dyn StorageAdapter>,
        target: Arc<dyn StorageAdapter>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            target,
            source_path: None,
            options,
        }
    }

    /// Open and initialize both backends from their configs.
    ///
    /// The source's data location is remembered so backups can copy it
    /// verbatim.
    pub async fn from_configs(
        source: &AdapterConfig,
        target: &AdapterConfig,
        options: MigrationOptions,
    ) -> Result<Self> {
        let source_adapter = create_adapter(source).await?;
        let target_adapter = create_adapter(target).await?;
        Ok(Self::new(source_adapter, target_adapter, options).with_source_path(source.data_path()))
    }

    /// Where the source keeps its data; backups copy it when present.
    pub fn with_source_path(mut self, path: Option<PathBuf>) -> Self {
        self.source_path = path;
        self
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Enumerate source collections into a plan.
    pub async fn plan(&self) -> Result<MigrationPlan> {
        let collections = self.source.list_collections().await?;
        Ok(MigrationPlan {
            from_strategy: self.source.strategy().to_string(),
            to_strategy: self.target.strategy().to_string(),
            collections,
            dry_run: self.options.dry_run,
            validate_data: self.options.validate_data,
            backup_data: self.options.backup_data,
        })
    }

    /// Run `plan`.
    ///
    /// Backup failures are fatal; everything after that is accumulated in
    /// the result.
    pub async fn execute(&self, plan: &MigrationPlan) -> Result<MigrationResult> {
        let started = Instant::now();
        info!(
            "Migrating {} collection(s) from {} to {}{}",
            plan.collections.len(),
            plan.from_strategy,
            plan.to_strategy,
            if plan.dry_run { " (dry run)" } else { "" }
        );

        let mut result = MigrationResult::default();
        if plan.backup_data && !plan.dry_run {
            let path = self.backup(plan).await?;
            info!("Source backed up to {}", path.display());
            result.backup_path = Some(path);
        }

        for collection in &plan.collections {
            let migrated = self.migrate_collection(collection, plan, &mut result.errors).await;
            result.records_migrated += migrated;
            result.collections_processed += 1;
        }

        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Migration finished: {} records, {} collections, {} errors in {}ms",
            result.records_migrated,
            result.collections_processed,
            result.errors.len(),
            result.duration_ms
        );
        Ok(result)
    }

    /// Copy one collection; returns how many records were written.
    async fn migrate_collection(
        &self,
        collection: &str,
        plan: &MigrationPlan,
        errors: &mut Vec<MigrationError>,
    ) -> usize {
        let batch_size = self.options.batch_size.max(1);
        let mut migrated = 0;
        let mut offset = 0;
        loop {
            let query = StorageQuery::new(collection)
                .with_limit(batch_size)
                .with_offset(offset);
            let page = match self.source.query(&query).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("Reading {} from source failed: {}", collection, e);
                    errors.push(MigrationError {
                        collection: collection.to_string(),
                        record_id: None,
                        message: e.to_string(),
                    });
                    return migrated;
                }
            };
            let fetched = page.len();

            for record in page {
                if plan.validate_data {
                    if let Err(message) = check_record(&record, collection) {
                        debug!("Skipping invalid record {}/{}: {}", collection, record.id, message);
                        errors.push(MigrationError {
                            collection: collection.to_string(),
                            record_id: Some(record.id),
                            message,
                        });
                        continue;
                    }
                }
                if plan.dry_run {
                    migrated += 1;
                    continue;
                }
                let id = record.id.clone();
                if let Err(e) = self.target.create(record).await {
                    warn!("Migration of {} stopped at {}: {}", collection, id, e);
                    errors.push(MigrationError {
                        collection: collection.to_string(),
                        record_id: Some(id),
                        message: e.to_string(),
                    });
                    return migrated;
                }
                migrated += 1;
            }

            if fetched < batch_size {
                break;
            }
            offset += fetched;
        }
        debug!("Collection {}: {} records migrated", collection, migrated);
        migrated
    }

    /// Snapshot the source under `{backup_root}/migration-backup-{ts}/`.
    async fn backup(&self, plan: &MigrationPlan) -> Result<PathBuf> {
        let timestamp = Utc::now();
        let dir = self.options.backup_root.join(format!(
            "migration-backup-{}",
            timestamp.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let data_dir = dir.join("data");
        tokio::fs::create_dir_all(&data_dir).await?;

        let backup_type = match &self.source_path {
            Some(path) if path.is_dir() => {
                copy_tree(path.clone(), data_dir.clone()).await?;
                "directory"
            }
            Some(path) if path.is_file() => {
                copy_database_files(path, &data_dir).await?;
                "file"
            }
            _ => {
                self.export_collections(&plan.collections, &data_dir).await?;
                "export"
            }
        };

        let metadata = json!({
            "sourceStrategy": plan.from_strategy,
            "backupType": backup_type,
            "timestamp": timestamp.to_rfc3339(),
            "sourcePath": self.source_path,
            "collections": plan.collections,
        });
        tokio::fs::write(
            dir.join("backup-metadata.json"),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;
        Ok(dir)
    }

    async fn export_collections(&self, collections: &[String], data_dir: &Path) -> Result<()> {
        for collection in collections {
            let records: Vec<DataRecord> = self.source.query(&StorageQuery::new(collection)).await?;
            let path = data_dir.join(format!("{}.json", collection));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&records)?)
                .await
                .map_err(|e| Error::persistence("backup", collection.clone(), e.into()))?;
        }
        Ok(())
    }
}

/// Structural checks applied before a record is written.
fn check_record(record: &DataRecord, collection: &str) -> std::result::Result<(), String> {
    if record.id.trim().is_empty() {
        return Err("record has no id".into());
    }
    if record.collection.is_empty() {
        return Err("record has no collection".into());
    }
    if record.collection != collection {
        return Err(format!(
            "record claims collection '{}' but was read from '{}'",
            record.collection, collection
        ));
    }
    if record.data.is_null() {
        return Err("record has no data".into());
    }
    Ok(())
}

async fn copy_tree(from: PathBuf, to: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        for entry in WalkDir::new(&from) {
            let entry = entry.map_err(|e| Error::Other(e.into()))?;
            let Ok(relative) = entry.path().strip_prefix(&from) else {
                continue;
            };
            let dest = to.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else if entry.file_type().is_file() {
                std::fs::copy(entry.path(), &dest)?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::Other(e.into()))?
}

/// Copy a database file with its WAL sidecars, when present.
async fn copy_database_files(path: &Path, data_dir: &Path) -> Result<()> {
    let Some(name) = path.file_name() else {
        return Err(Error::Config(format!("{} is not a file path", path.display())));
    };
    tokio::fs::copy(path, data_dir.join(name)).await?;
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = name.to_os_string();
        sidecar.push(suffix);
        let source = path.with_file_name(&sidecar);
        if tokio::fs::try_exists(&source).await.unwrap_or(false) {
            tokio::fs::copy(&source, data_dir.join(&sidecar)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, MemoryConfig};
    use crate::storage::{FileAdapter, MemoryAdapter};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    async fn seeded_memory(valid: usize, invalid: usize) -> Arc<MemoryAdapter> {
        let source = Arc::new(MemoryAdapter::ephemeral());
        for i in 0..valid {
            source
                .create(DataRecord::new("users", format!("u{}", i), json!({"n": i})))
                .await
                .unwrap();
        }
        for i in 0..invalid {
            source
                .create(DataRecord::new("users", format!("bad{}", i), Value::Null))
                .await
                .unwrap();
        }
        source
            .create(DataRecord::new("posts", "p1", json!({"title": "hello"})))
            .await
            .unwrap();
        source
    }

    fn options(backup_root: &Path) -> MigrationOptions {
        MigrationOptions {
            backup_data: false,
            batch_size: 2,
            backup_root: backup_root.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_plan_lists_source_collections() {
        let dir = TempDir::new().unwrap();
        let source = seeded_memory(1, 0).await;
        let target = Arc::new(MemoryAdapter::ephemeral());
        let service = MigrationService::new(source, target, options(dir.path()));
        let plan = service.plan().await.unwrap();
        assert_eq!(plan.from_strategy, "memory");
        assert_eq!(plan.to_strategy, "memory");
        assert_eq!(plan.collections, vec!["posts", "users"]);
        assert!(plan.validate_data);
    }

    #[tokio::test]
    async fn test_valid_records_are_all_migrated() {
        let dir = TempDir::new().unwrap();
        let source = seeded_memory(5, 0).await;
        let target = Arc::new(FileAdapter::new(FileConfig {
            base_path: dir.path().join("target"),
            namespace: "default".into(),
        }));
        target.initialize().await.unwrap();
        let service = MigrationService::new(source, target.clone(), options(dir.path()));
        let plan = service.plan().await.unwrap();
        let result = service.execute(&plan).await.unwrap();

        assert!(result.success);
        assert_eq!(result.records_migrated, 6);
        assert_eq!(result.collections_processed, 2);
        assert!(result.errors.is_empty());
        let u3 = target.read("users", "u3").await.unwrap().unwrap();
        assert_eq!(u3.data, json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped_and_reported() {
        let dir = TempDir::new().unwrap();
        let source = seeded_memory(4, 3).await;
        let target = Arc::new(MemoryAdapter::ephemeral());
        let service = MigrationService::new(source, target.clone(), options(dir.path()));
        let plan = service.plan().await.unwrap();
        let result = service.execute(&plan).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.records_migrated, 5);
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().all(|e| e.collection == "users"));
        assert!(target.read("users", "bad0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_failure_stops_only_that_collection() {
        let dir = TempDir::new().unwrap();
        let source = seeded_memory(3, 0).await;
        let target = Arc::new(MemoryAdapter::ephemeral());
        target
            .create(DataRecord::new("users", "u0", json!({"already": true})))
            .await
            .unwrap();
        let service = MigrationService::new(source, target.clone(), options(dir.path()));
        let plan = service.plan().await.unwrap();
        let result = service.execute(&plan).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].record_id.as_deref(), Some("u0"));
        assert!(target.read("posts", "p1").await.unwrap().is_some());
        assert!(target.read("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let source = seeded_memory(3, 1).await;
        let target = Arc::new(MemoryAdapter::ephemeral());
        let service = MigrationService::new(
            source,
            target.clone(),
            MigrationOptions {
                dry_run: true,
                backup_data: true,
                ..options(dir.path())
            },
        );
        let plan = service.plan().await.unwrap();
        let result = service.execute(&plan).await.unwrap();
        assert_eq!(result.records_migrated, 4);
        assert_eq!(result.errors.len(), 1);
        assert!(result.backup_path.is_none());
        assert!(target.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backup_copies_file_store_tree() {
        let dir = TempDir::new().unwrap();
        let source_config = AdapterConfig::File(FileConfig {
            base_path: dir.path().join("source"),
            namespace: "ns".into(),
        });
        let target_config = AdapterConfig::Memory(MemoryConfig::default());
        let service = MigrationService::from_configs(
            &source_config,
            &target_config,
            MigrationOptions {
                backup_data: true,
                backup_root: dir.path().join("backups"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        service
            .source
            .create(DataRecord::new("notes", "n1", json!({"body": "x"})))
            .await
            .unwrap();

        let plan = service.plan().await.unwrap();
        let result = service.execute(&plan).await.unwrap();
        assert!(result.success);

        let backup = result.backup_path.unwrap();
        assert!(backup.starts_with(dir.path().join("backups")));
        assert!(backup.join("data").join("notes").join("n1.json").is_file());
        let metadata: Value =
            serde_json::from_slice(&std::fs::read(backup.join("backup-metadata.json")).unwrap())
                .unwrap();
        assert_eq!(metadata["sourceStrategy"], "file");
        assert_eq!(metadata["backupType"], "directory");
        assert_eq!(metadata["collections"], json!(["notes"]));
    }

    #[tokio::test]
    async fn test_backup_exports_when_source_has_no_path() {
        let dir = TempDir::new().unwrap();
        let source = seeded_memory(2, 0).await;
        let target = Arc::new(MemoryAdapter::ephemeral());
        let service = MigrationService::new(
            source,
            target,
            MigrationOptions {
                backup_data: true,
                ..options(dir.path())
            },
        );
        let plan = service.plan().await.unwrap();
        let result = service.execute(&plan).await.unwrap();
        let backup = result.backup_path.unwrap();
        let exported: Vec<DataRecord> =
            serde_json::from_slice(&std::fs::read(backup.join("data").join("users.json")).unwrap())
                .unwrap();
        assert_eq!(exported.len(), 2);
    }
}
