//! Docstore CLI
//!
//! Command-line interface for inspecting and maintaining Docstore backends.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::StoreArgs;

#[derive(Parser)]
#[command(name = "docstore")]
#[command(author, version, about = "Document storage with pluggable backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    store: StoreArgs,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-collection statistics
    Stats {
        /// Only this collection
        collection: Option<String>,
    },

    /// List collections
    Collections,

    /// Query a collection
    Query {
        collection: String,

        /// Filter as a JSON object, e.g. '{"age": {"$gte": 18}}'
        #[arg(short, long)]
        filter: Option<String>,

        /// Sort field; prefix with '-' for descending
        #[arg(short, long)]
        sort: Vec<String>,

        /// Maximum results
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long)]
        offset: Option<usize>,

        /// Show the execution plan instead of results
        #[arg(long)]
        explain: bool,
    },

    /// Copy every collection into another backend
    Migrate {
        /// JSON config of the target backend
        #[arg(long, conflicts_with = "to_strategy")]
        to_config: Option<PathBuf>,

        /// Target strategy (memory, file, sqlite)
        #[arg(long, requires = "to_path")]
        to_strategy: Option<String>,

        /// Target data path
        #[arg(long)]
        to_path: Option<PathBuf>,

        /// Count records without writing
        #[arg(long)]
        dry_run: bool,

        /// Write records without structural checks
        #[arg(long)]
        no_validate: bool,

        /// Skip the source backup
        #[arg(long)]
        no_backup: bool,

        #[arg(long, default_value = "10000")]
        batch_size: usize,

        #[arg(long, default_value = ".docstore/backups")]
        backup_root: PathBuf,
    },

    /// Expire TTL records and run backend housekeeping
    Cleanup,

    /// Generate embeddings for records that have none
    Backfill {
        collection: String,

        /// Payload field holding the text to embed
        #[arg(long, default_value = "text")]
        field: String,

        /// Embedding worker socket
        #[arg(long, default_value = ".docstore/worker.sock")]
        socket: PathBuf,

        /// Embed in-process instead of using the worker
        #[arg(long)]
        local: bool,

        #[arg(long, default_value = "100")]
        batch_size: usize,

        /// Re-embed records that already have a vector
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("docstore=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("docstore=info")
            .init();
    }

    match cli.command {
        Commands::Stats { collection } => {
            commands::stats::run(&cli.store, collection).await?;
        }
        Commands::Collections => {
            commands::collections::run(&cli.store).await?;
        }
        Commands::Query {
            collection,
            filter,
            sort,
            limit,
            offset,
            explain,
        } => {
            let args = commands::query::QueryArgs {
                collection,
                filter,
                sort,
                limit,
                offset,
                explain,
            };
            commands::query::run(&cli.store, args).await?;
        }
        Commands::Migrate {
            to_config,
            to_strategy,
            to_path,
            dry_run,
            no_validate,
            no_backup,
            batch_size,
            backup_root,
        } => {
            let target = commands::migrate::target_config(to_config, to_strategy, to_path)?;
            let options = docstore_core::migration::MigrationOptions {
                dry_run,
                validate_data: !no_validate,
                backup_data: !no_backup,
                batch_size,
                backup_root,
            };
            commands::migrate::run(&cli.store, target, options).await?;
        }
        Commands::Cleanup => {
            commands::cleanup::run(&cli.store).await?;
        }
        Commands::Backfill {
            collection,
            field,
            socket,
            local,
            batch_size,
            force,
        } => {
            let options = docstore_core::vector::BackfillOptions {
                text_field: field,
                batch_size,
                skip_indexed: !force,
            };
            commands::backfill::run(&cli.store, &collection, options, socket, local).await?;
        }
    }

    Ok(())
}
