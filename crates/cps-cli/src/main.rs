use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cps_storage::PgStore;
use cps_sync::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cps")]
#[command(about = "Cultural programme sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle against the configured feeds and database.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Serve the admin HTTP surface (and the scheduler, when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = cps_sync::run_sync_once_from_env()
                .await
                .context("sync run failed")?;
            println!(
                "sync complete: run_id={} venues={}(+{} deleted) programmes={}(+{} skipped, {} deleted)",
                summary.run_id,
                summary.venues.upserted,
                summary.venues.soft_deleted,
                summary.programmes.upserted,
                summary.programmes.skipped,
                summary.programmes.soft_deleted,
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            cps_web::serve_from_env().await?;
        }
    }

    Ok(())
}
