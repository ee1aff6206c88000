//! CLI command implementations.

pub mod backfill;
pub mod cleanup;
pub mod collections;
pub mod migrate;
pub mod query;
pub mod stats;

use anyhow::{bail, Context, Result};
use clap::Args;
use docstore_core::config::AdapterConfig;
use docstore_core::storage::{open_store, Store};
use std::path::PathBuf;
use std::sync::Arc;

/// Which backend to open. Falls back to `DOCSTORE_*` environment variables.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// JSON adapter config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend strategy (memory, file, sqlite)
    #[arg(long, global = true)]
    pub strategy: Option<String>,

    /// Database file or base directory
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,
}

impl StoreArgs {
    pub fn resolve(&self) -> Result<AdapterConfig> {
        let base = match &self.config {
            Some(file) => AdapterConfig::from_file(file)
                .with_context(|| format!("loading {}", file.display()))?,
            None => AdapterConfig::from_env()?,
        };
        apply_overrides(base, self.strategy.as_deref(), self.path.clone())
    }
}

/// Switch strategy and/or data path on top of `config`.
pub fn apply_overrides(
    config: AdapterConfig,
    strategy: Option<&str>,
    path: Option<PathBuf>,
) -> Result<AdapterConfig> {
    let mut config = match strategy {
        None => config,
        Some(s) if s == config.strategy() => config,
        Some("memory") => AdapterConfig::Memory(Default::default()),
        Some("file") => AdapterConfig::File(Default::default()),
        Some("sqlite") => AdapterConfig::Sqlite(Default::default()),
        Some(other) => bail!("unknown strategy '{}' (expected memory, file or sqlite)", other),
    };
    if let Some(path) = path {
        match &mut config {
            AdapterConfig::Memory(c) => c.snapshot_path = Some(path),
            AdapterConfig::File(c) => c.base_path = path,
            AdapterConfig::Sqlite(c) => c.path = path,
        }
    }
    Ok(config)
}

/// Open and initialize the selected backend.
pub async fn open(args: &StoreArgs) -> Result<Arc<dyn Store>> {
    let config = args.resolve()?;
    let store = open_store(&config)
        .await
        .with_context(|| format!("opening {} store", config.strategy()))?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_switch_backend_and_path() {
        let config = apply_overrides(AdapterConfig::default(), Some("file"), Some("/data".into()))
            .unwrap();
        match config {
            AdapterConfig::File(c) => {
                assert_eq!(c.base_path, PathBuf::from("/data"));
                assert_eq!(c.namespace, "default");
            }
            other => panic!("expected file config, got {:?}", other),
        }
        assert!(apply_overrides(AdapterConfig::default(), Some("redis"), None).is_err());
    }
}
