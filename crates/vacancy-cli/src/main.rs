use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vacancy_storage::{DocumentStore, ElasticStore, StoreConfig};
use vacancy_sync::{build_harvester, HarvestConfig, HarvestPipeline};
use vacancy_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "vacancy-cli")]
#[command(about = "Vacancy harvester command-line interface")]
struct Cli {
    /// Port for the read API.
    #[arg(short, long, default_value_t = 8080, global = true)]
    port: u16,

    /// Serve without checking for the index or running the initial harvest.
    #[arg(long, global = true)]
    skip_bootstrap: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest the default term if the index is missing, then serve the API.
    Serve,
    /// Run one harvest and exit.
    Harvest {
        #[arg(short, long)]
        text: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let store_config = StoreConfig::from_env();
    let harvest_config = HarvestConfig::from_env();

    let store: Arc<dyn DocumentStore> = Arc::new(
        ElasticStore::connect(&store_config)
            .await
            .context("setting up elasticsearch client")?,
    );
    let harvester = build_harvester(&harvest_config, store.clone())?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        }
    });

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if !cli.skip_bootstrap {
                bootstrap_index(
                    store.as_ref(),
                    &harvester.pipeline,
                    &store_config.index,
                    &harvest_config.default_term,
                    shutdown.child_token(),
                )
                .await;
            }
            let state = AppState::new(
                store.clone(),
                harvester.pipeline.clone(),
                harvest_config.default_term.clone(),
            )
            .with_shutdown(shutdown.clone());
            vacancy_web::serve(state, cli.port).await?;
        }
        Commands::Harvest { text } => {
            let term = text.unwrap_or_else(|| harvest_config.default_term.clone());
            let summary = harvester
                .pipeline
                .harvest_with_cancel(&term, shutdown.child_token())
                .await;
            println!(
                "harvest complete: run_id={} term={} workers={} fetched={} missing={} stored={}",
                summary.run_id,
                summary.term,
                summary.workers,
                summary.fetched,
                summary.missing,
                summary.stored
            );
        }
    }

    let left = harvester.ledger.len();
    let stats = harvester.drain.shutdown().await;
    info!(
        drains = stats.drains,
        replayed = stats.replayed,
        failed = stats.failed,
        stored = stats.stored,
        "retry worker stopped"
    );
    if left > 0 {
        warn!(pending = left, "failed requests below the retry threshold were not replayed");
    }

    Ok(())
}

async fn bootstrap_index(
    store: &dyn DocumentStore,
    pipeline: &HarvestPipeline,
    index: &str,
    term: &str,
    cancel: CancellationToken,
) {
    let exists = store.index_exists(index).await.unwrap_or_else(|err| {
        warn!(index, error = %err, "could not check index; assuming it is missing");
        false
    });
    if exists {
        info!(index, "index present; skipping initial harvest");
        return;
    }

    info!(index, term, "index missing; running initial harvest");
    let summary = pipeline.harvest_with_cancel(term, cancel).await;
    info!(stored = summary.stored, "initial harvest finished");
}
