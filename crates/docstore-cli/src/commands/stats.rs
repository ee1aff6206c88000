//! Stats command implementation.

use super::StoreArgs;
use anyhow::Result;
use colored::Colorize;

/// Run the stats command.
pub async fn run(args: &StoreArgs, collection: Option<String>) -> Result<()> {
    let store = super::open(args).await?;

    let names = match collection {
        Some(name) => vec![name],
        None => store.list_collections().await?,
    };

    println!("{} {} store statistics", "→".blue(), store.strategy());
    println!();

    let mut total_records = 0;
    let mut total_bytes = 0;
    for name in &names {
        let Some(stats) = store.get_collection_stats(name).await? else {
            eprintln!("{} Collection not found: {}", "✗".red(), name);
            continue;
        };
        let vectors = store.get_vector_count(name).await?;
        total_records += stats.record_count;
        total_bytes += stats.total_size;

        println!("  {}", name.bold());
        println!("    Records: {}", stats.record_count.to_string().green());
        println!("    Size: {:.2} KB", stats.total_size as f64 / 1024.0);
        if vectors > 0 {
            println!("    Vectors: {}", vectors.to_string().cyan());
        }
        if let Some(at) = stats.last_modified {
            println!("    Last modified: {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
    }

    println!();
    println!(
        "  {} collection(s), {} record(s), {:.2} MB",
        names.len(),
        total_records.to_string().green(),
        total_bytes as f64 / (1024.0 * 1024.0)
    );

    store.close().await?;
    Ok(())
}
