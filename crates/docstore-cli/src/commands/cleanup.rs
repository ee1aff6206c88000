//! Cleanup command implementation.

use super::StoreArgs;
use anyhow::Result;
use colored::Colorize;

/// Run the cleanup command.
pub async fn run(args: &StoreArgs) -> Result<()> {
    let store = super::open(args).await?;

    println!("{} Cleaning up {} store...", "→".blue(), store.strategy());
    let report = store.cleanup().await?;

    println!("{} Cleanup complete", "✓".green());
    println!("  Expired records removed: {}", report.expired_records);
    println!("  Empty collections pruned: {}", report.empty_collections_pruned);
    if report.temp_files_removed > 0 {
        println!("  Stale temp files removed: {}", report.temp_files_removed);
    }

    store.close().await?;
    Ok(())
}
