//! Migrate command implementation.

use super::StoreArgs;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use docstore_core::config::AdapterConfig;
use docstore_core::migration::{MigrationOptions, MigrationService};
use std::path::PathBuf;

/// Target backend from either a config file or a strategy plus path.
pub fn target_config(
    config: Option<PathBuf>,
    strategy: Option<String>,
    path: Option<PathBuf>,
) -> Result<AdapterConfig> {
    match (config, strategy) {
        (Some(file), _) => AdapterConfig::from_file(&file)
            .with_context(|| format!("loading target config {}", file.display())),
        (None, Some(strategy)) => {
            super::apply_overrides(AdapterConfig::default(), Some(&strategy), path)
        }
        (None, None) => bail!("migrate needs --to-config or --to-strategy/--to-path"),
    }
}

/// Run the migrate command.
pub async fn run(args: &StoreArgs, target: AdapterConfig, options: MigrationOptions) -> Result<()> {
    let source = args.resolve()?;
    if source == target {
        bail!("source and target are the same backend");
    }

    let service = MigrationService::from_configs(&source, &target, options).await?;
    let plan = service.plan().await?;

    println!(
        "{} Migrating {} → {}{}",
        "→".blue(),
        plan.from_strategy.cyan(),
        plan.to_strategy.cyan(),
        if plan.dry_run { " (dry run)".yellow().to_string() } else { String::new() }
    );
    for name in &plan.collections {
        println!("  {} {}", "•".dimmed(), name);
    }
    println!();

    let result = service.execute(&plan).await?;

    if let Some(path) = &result.backup_path {
        println!("  Backup: {}", path.display());
    }
    println!("  Collections processed: {}", result.collections_processed);
    println!("  Records migrated: {}", result.records_migrated.to_string().green());
    println!("  Duration: {}ms", result.duration_ms);

    if result.success {
        println!("{} Migration complete", "✓".green());
    } else {
        println!("{} Migration finished with {} error(s):", "✗".red(), result.errors.len());
        for error in &result.errors {
            match &error.record_id {
                Some(id) => println!("  {}/{}: {}", error.collection, id, error.message),
                None => println!("  {}: {}", error.collection, error.message),
            }
        }
        bail!("migration incomplete");
    }
    Ok(())
}
