//! Backfill command implementation.

use super::StoreArgs;
use anyhow::Result;
use colored::Colorize;
use docstore_core::storage::Embedder;
use docstore_core::vector::{BackfillOptions, VectorSearch};
use std::path::PathBuf;
use std::sync::Arc;

fn embedder(socket: PathBuf, local: bool) -> Result<Arc<dyn Embedder>> {
    if local {
        #[cfg(feature = "local")]
        {
            println!("{} Loading embedding model...", "→".blue());
            return Ok(Arc::new(docstore_embeddings::LocalEmbedder::new()?));
        }
        #[cfg(not(feature = "local"))]
        anyhow::bail!("--local requires the 'local' feature");
    }
    #[cfg(unix)]
    {
        let client = docstore_embeddings::WorkerClient::new(
            docstore_embeddings::WorkerConfig::new(socket),
        );
        Ok(Arc::new(client))
    }
    #[cfg(not(unix))]
    {
        let _ = socket;
        anyhow::bail!("the embedding worker is only reachable on Unix; use --local")
    }
}

/// Run the backfill command.
pub async fn run(
    args: &StoreArgs,
    collection: &str,
    options: BackfillOptions,
    socket: PathBuf,
    local: bool,
) -> Result<()> {
    let embedder = embedder(socket, local)?;
    let store = super::open(args).await?;
    let search = VectorSearch::for_store(Arc::clone(&store)).with_embedder(embedder);

    println!(
        "{} Backfilling {} from field '{}'",
        "→".blue(),
        collection.cyan(),
        options.text_field
    );
    let report = search
        .backfill(collection, &options, |p| {
            let eta = p
                .estimated_remaining
                .map(|d| format!(", ~{}s left", d.as_secs()))
                .unwrap_or_default();
            println!(
                "  {}/{} processed, {} failed{}",
                p.processed, p.total, p.failed, eta
            );
        })
        .await?;

    println!();
    println!("{} Backfill complete", "✓".green());
    println!("  Indexed: {}", report.indexed.to_string().green());
    println!("  Already indexed: {}", report.skipped);
    if report.failed > 0 {
        println!("  Failed: {}", report.failed.to_string().red());
    }
    println!("  Duration: {}ms", report.duration_ms);

    let stats = search.stats(collection).await?;
    println!(
        "  Coverage: {}/{} records{}",
        stats.indexed_records,
        stats.total_records,
        stats
            .dimensions
            .map(|d| format!(" ({} dimensions)", d))
            .unwrap_or_default()
    );

    store.close().await?;
    Ok(())
}
