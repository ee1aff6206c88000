//! Collections command implementation.

use super::StoreArgs;
use anyhow::Result;
use colored::Colorize;

/// Run the collections command.
pub async fn run(args: &StoreArgs) -> Result<()> {
    let store = super::open(args).await?;
    let names = store.list_collections().await?;

    if names.is_empty() {
        println!("{} No collections.", "→".yellow());
    } else {
        for name in &names {
            println!("{}", name);
        }
    }

    store.close().await?;
    Ok(())
}
