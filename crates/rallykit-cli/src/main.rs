use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rallykit_catalog::static_catalog;
use rallykit_core::SyncTrigger;
use rallykit_storage::{
    AuthoringStore, BundleStore, HttpAuthoringStore, MemoryAuthoringStore, MemoryStore, PgStore,
    ProductStore, SyncRunStore,
};
use rallykit_sync::{build_scheduler, RuntimeConfig};
use rallykit_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "rallykit-cli")]
#[command(about = "Rallykit campaign-bundle catalog service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP catalog API (default).
    Serve,
    /// Run one sync pass from the authoring store and exit.
    Sync,
    /// Apply the database migrations and exit.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn build_state(config: &RuntimeConfig) -> Result<AppState> {
    let (products, bundles, runs): (
        Arc<dyn ProductStore>,
        Arc<dyn BundleStore>,
        Arc<dyn SyncRunStore>,
    ) = match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url)
                    .await
                    .context("connecting to primary store")?,
            );
            (store.clone(), store.clone(), store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; serving from an in-memory primary store");
            let store = Arc::new(MemoryStore::default());
            for bundle in static_catalog() {
                store.insert(bundle).await;
            }
            (store.clone(), store.clone(), store)
        }
    };

    let authoring: Arc<dyn AuthoringStore> = match &config.authoring_url {
        Some(url) => Arc::new(
            HttpAuthoringStore::new(url.clone(), config.http_timeout())
                .context("building authoring client")?,
        ),
        None => {
            tracing::warn!("RALLYKIT_AUTHORING_URL not set; authoring tier is empty");
            Arc::new(MemoryAuthoringStore::default())
        }
    };

    Ok(AppState::build(
        products,
        bundles,
        runs,
        authoring,
        config.store_timeout(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = RuntimeConfig::load(Path::new(".")).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let state = build_state(&config).await?;
            if config.scheduler_enabled {
                let scheduler = build_scheduler(state.sync.clone(), &config.sync_cron).await?;
                scheduler.start().await.context("starting scheduler")?;
                tracing::info!(cron = %config.sync_cron, "sync scheduler started");
            }
            rallykit_web::serve(state, &config).await
        }
        Commands::Sync => {
            let state = build_state(&config).await?;
            let report = state.sync.run(SyncTrigger::Manual).await;
            println!(
                "sync {}: run_id={} created={} updated={} skipped={} errors={} retries={}",
                report.run.status.as_str(),
                report.run.id,
                report.run.counts.created,
                report.run.counts.updated,
                report.run.counts.skipped,
                report.run.counts.errors,
                report.run.retry_count,
            );
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            Ok(())
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(url)
                .await
                .context("connecting to primary store")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
            Ok(())
        }
    }
}
