mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glist_storage::{CatalogClient, ResolutionCache};
use glist_sync::{ResolverEngine, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "glist")]
#[command(about = "Keep the game list sheets in sync with the game catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled sheet, write corrections back and render pages.
    Sync,
    /// Resolve one title through the cache and print the record.
    Resolve { title: String },
    /// Drop a cached resolution so the next run queries the catalog again.
    Forget { title: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init_tracing("info")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = glist_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sheets={} rows_resolved={} cache_entries={}",
                summary.run_id,
                summary.enabled_sheets,
                summary.rows_resolved(),
                summary.cache_entries
            );
        }
        Commands::Resolve { title } => {
            let config = SyncConfig::from_env();
            let catalog = CatalogClient::new(config.catalog_config())
                .context("configuring catalog client")?;
            let mut cache = ResolutionCache::new(config.cache_path.clone());
            cache.load().await;

            let mut resolver = ResolverEngine::new(Box::new(catalog), cache);
            let record = resolver.resolve(&title, None).await?;
            resolver.cache().save().await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Forget { title } => {
            let config = SyncConfig::from_env();
            let mut cache = ResolutionCache::new(config.cache_path.clone());
            cache.load().await;
            match cache.forget(&title) {
                Some(entry) => {
                    cache.save().await?;
                    info!(%title, id = %entry.id, "cache entry removed");
                    println!("forgot {title} (was {})", entry.id);
                }
                None => println!("{title} is not cached"),
            }
        }
    }

    Ok(())
}
