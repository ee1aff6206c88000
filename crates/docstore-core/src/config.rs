//! Adapter configuration.
//!
//! Each backend has its own config struct with sensible defaults; the
//! tagged [`AdapterConfig`] selects one and can be loaded from JSON or from
//! environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// In-memory backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// When set, the whole store is snapshotted to this JSON file
    pub snapshot_path: Option<PathBuf>,
    /// Seconds between background snapshots (0 disables the timer)
    pub snapshot_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_secs: 30,
        }
    }
}

/// JSON-file-per-record backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub base_path: PathBuf,
    pub namespace: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".docstore/files"),
            namespace: "default".to_string(),
        }
    }
}

impl FileConfig {
    /// `{base_path}/{namespace}`
    pub fn root(&self) -> PathBuf {
        self.base_path.join(&self.namespace)
    }
}

/// SQLite backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// Connections opened up front
    pub pool_size: usize,
    pub busy_timeout_ms: u64,
    /// Bound on waiting for a connection; `None` waits indefinitely
    pub acquire_timeout_ms: Option<u64>,
    /// Seconds between idle-connection pings; `None` disables the check
    pub health_check_interval_secs: Option<u64>,
    /// Collection → payload fields promoted to indexed columns
    pub extracted_fields: HashMap<String, Vec<String>>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".docstore/docstore.db"),
            pool_size: 4,
            busy_timeout_ms: 5000,
            acquire_timeout_ms: None,
            health_check_interval_secs: Some(60),
            extracted_fields: HashMap::new(),
        }
    }
}

/// Backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum AdapterConfig {
    Memory(MemoryConfig),
    File(FileConfig),
    Sqlite(SqliteConfig),
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig::Sqlite(SqliteConfig::default())
    }
}

impl AdapterConfig {
    /// Backend name, matching [`crate::storage::StorageAdapter::strategy`].
    pub fn strategy(&self) -> &'static str {
        match self {
            AdapterConfig::Memory(_) => "memory",
            AdapterConfig::File(_) => "file",
            AdapterConfig::Sqlite(_) => "sqlite",
        }
    }

    /// Filesystem location holding the backend's data, if any.
    pub fn data_path(&self) -> Option<PathBuf> {
        match self {
            AdapterConfig::Memory(c) => c.snapshot_path.clone(),
            AdapterConfig::File(c) => Some(c.root()),
            AdapterConfig::Sqlite(c) => Some(c.path.clone()),
        }
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from environment variables.
    ///
    /// `DOCSTORE_STRATEGY` picks the backend (default `sqlite`);
    /// `DOCSTORE_PATH`, `DOCSTORE_NAMESPACE` and `DOCSTORE_POOL_SIZE`
    /// override the matching fields.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let strategy = get("DOCSTORE_STRATEGY").unwrap_or_else(|| "sqlite".to_string());
        let path = get("DOCSTORE_PATH").map(PathBuf::from);
        let config = match strategy.as_str() {
            "memory" => AdapterConfig::Memory(MemoryConfig {
                snapshot_path: path,
                ..Default::default()
            }),
            "file" => {
                let mut c = FileConfig::default();
                if let Some(path) = path {
                    c.base_path = path;
                }
                if let Some(ns) = get("DOCSTORE_NAMESPACE") {
                    c.namespace = ns;
                }
                AdapterConfig::File(c)
            }
            "sqlite" => {
                let mut c = SqliteConfig::default();
                if let Some(path) = path {
                    c.path = path;
                }
                if let Some(size) = get("DOCSTORE_POOL_SIZE") {
                    c.pool_size = size.parse().map_err(|_| {
                        Error::Config(format!("DOCSTORE_POOL_SIZE must be a number, got '{}'", size))
                    })?;
                }
                AdapterConfig::Sqlite(c)
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown DOCSTORE_STRATEGY '{}' (expected memory, file or sqlite)",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no backend can run with.
    pub fn validate(&self) -> Result<()> {
        match self {
            AdapterConfig::Sqlite(c) if c.pool_size == 0 => {
                Err(Error::Config("pool size must be at least 1".into()))
            }
            AdapterConfig::File(c) if c.namespace.is_empty() => {
                Err(Error::Config("file namespace must not be empty".into()))
            }
            AdapterConfig::File(c) => crate::record::validate_collection_name(&c.namespace)
                .map_err(|e| Error::Config(format!("file namespace: {}", e))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults_to_sqlite() {
        let config = AdapterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.strategy(), "sqlite");
    }

    #[test]
    fn test_file_strategy_from_env() {
        let vars = [
            ("DOCSTORE_STRATEGY", "file"),
            ("DOCSTORE_PATH", "/tmp/store"),
            ("DOCSTORE_NAMESPACE", "tenant-a"),
        ];
        match AdapterConfig::from_lookup(lookup(&vars)).unwrap() {
            AdapterConfig::File(c) => {
                assert_eq!(c.root(), PathBuf::from("/tmp/store/tenant-a"));
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_pool = [("DOCSTORE_POOL_SIZE", "many")];
        assert!(matches!(
            AdapterConfig::from_lookup(lookup(&bad_pool)),
            Err(Error::Config(_))
        ));
        let zero_pool = [("DOCSTORE_POOL_SIZE", "0")];
        assert!(AdapterConfig::from_lookup(lookup(&zero_pool)).is_err());
        let unknown = [("DOCSTORE_STRATEGY", "mongo")];
        assert!(AdapterConfig::from_lookup(lookup(&unknown)).is_err());
    }

    #[test]
    fn test_tagged_json() {
        let raw = r#"{"strategy": "sqlite", "path": "/tmp/x.db", "poolSize": 2}"#;
        let config: AdapterConfig = serde_json::from_str(raw).unwrap();
        match config {
            AdapterConfig::Sqlite(c) => {
                assert_eq!(c.pool_size, 2);
                assert_eq!(c.busy_timeout_ms, 5000);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }
}
