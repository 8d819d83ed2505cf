//! Harvest pipeline orchestration: fan out over listing pages, enrich every
//! listing with its detail record and bulk-write the result.

mod retry;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vacancy_adapters::{HhClient, ListingSource, DEFAULT_API_BASE, DEFAULT_USER_AGENT};
use vacancy_core::{ListingDetail, TagStripper, VacancyDocument};
use vacancy_storage::{DocumentStore, HttpClientConfig, HttpFetcher};

pub use retry::{DrainHandle, DrainStats, RetryLedger, DEFAULT_RETRY_THRESHOLD};

pub const CRATE_NAME: &str = "vacancy-sync";

pub const DEFAULT_SEARCH_TERM: &str = "Golang";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub rate_limit_backoff: Duration,
    pub retry_threshold: usize,
    pub default_term: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            rate_limit_backoff: Duration::from_millis(200),
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            default_term: DEFAULT_SEARCH_TERM.to_string(),
        }
    }
}

impl HarvestConfig {
    /// Blank variables count as unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: non_blank_env("HH_API_BASE").unwrap_or(defaults.api_base),
            user_agent: non_blank_env("HH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: non_blank_env("HH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            ..defaults
        }
    }
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub term: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workers: usize,
    pub fetched: usize,
    pub missing: usize,
    pub stored: usize,
    pub cancelled: bool,
}

type Collected = Arc<Mutex<Vec<Option<ListingDetail>>>>;

pub struct HarvestPipeline {
    source: Arc<dyn ListingSource>,
    store: Arc<dyn DocumentStore>,
    stripper: TagStripper,
    rate_limit_backoff: Duration,
}

impl HarvestPipeline {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: Arc<dyn DocumentStore>,
        rate_limit_backoff: Duration,
    ) -> Self {
        Self {
            source,
            store,
            stripper: TagStripper::new(),
            rate_limit_backoff,
        }
    }

    pub async fn harvest(&self, term: &str) -> HarvestSummary {
        self.harvest_with_cancel(term, CancellationToken::new()).await
    }

    /// Runs one harvest for `term`. Page and detail failures never abort the
    /// run; whatever was fetched is bulk-written once every worker is done,
    /// including after cancellation.
    pub async fn harvest_with_cancel(&self, term: &str, cancel: CancellationToken) -> HarvestSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("harvest", %run_id, term);

        async move {
            let total_pages = match self.source.fetch_page(term, 0).await {
                Ok(first) => first.total_pages,
                Err(err) => {
                    warn!(error = %err, "first listing page unavailable; nothing to fan out");
                    0
                }
            };
            info!(total_pages, "starting page workers");

            let collected: Collected = Arc::new(Mutex::new(Vec::new()));
            let mut workers = JoinSet::new();
            for page in 0..total_pages {
                workers.spawn(
                    harvest_page(
                        self.source.clone(),
                        term.to_string(),
                        page,
                        collected.clone(),
                        self.rate_limit_backoff,
                        cancel.clone(),
                    )
                    .in_current_span(),
                );
            }
            let launched = workers.len();
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "page worker did not complete");
                }
            }

            let collected = std::mem::take(&mut *collected.lock().await);
            let total = collected.len();
            let docs = collected
                .into_iter()
                .flatten()
                .map(|detail| VacancyDocument::from_detail(detail, &self.stripper))
                .collect::<Vec<_>>();
            let fetched = docs.len();

            let stored = match self.store.bulk_upsert(&docs).await {
                Ok(outcome) => outcome.indexed,
                Err(err) => {
                    warn!(error = %err, documents = fetched, "bulk write failed");
                    0
                }
            };

            let summary = HarvestSummary {
                run_id,
                term: term.to_string(),
                started_at,
                finished_at: Utc::now(),
                workers: launched,
                fetched,
                missing: total - fetched,
                stored,
                cancelled: cancel.is_cancelled(),
            };
            info!(
                workers = summary.workers,
                fetched = summary.fetched,
                missing = summary.missing,
                stored = summary.stored,
                cancelled = summary.cancelled,
                "harvest finished"
            );
            summary
        }
        .instrument(span)
        .await
    }
}

/// One page worker: fetches its page, then every detail on it in order.
/// After a 429 the next detail request waits for `backoff`.
async fn harvest_page(
    source: Arc<dyn ListingSource>,
    term: String,
    page: u32,
    collected: Collected,
    backoff: Duration,
    cancel: CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    let listing = match source.fetch_page(&term, page).await {
        Ok(listing) => listing,
        Err(err) => {
            warn!(page, error = %err, "listing page unavailable");
            return;
        }
    };

    let mut rate_limited = false;
    for item in &listing.items {
        if rate_limited {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        let fetch = source.fetch_detail(&item.id).await;
        rate_limited = fetch.is_rate_limited();
        collected.lock().await.push(fetch.detail);
    }
}

/// A pipeline wired to the remote API, with its retry ledger running.
pub struct Harvester {
    pub pipeline: Arc<HarvestPipeline>,
    pub ledger: RetryLedger,
    pub drain: DrainHandle,
}

/// Must be called from within a tokio runtime; the drain worker is spawned here.
pub fn build_harvester(config: &HarvestConfig, store: Arc<dyn DocumentStore>) -> Result<Harvester> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;

    let replay_source = Arc::new(HhClient::new(fetcher.clone(), config.api_base.clone()));
    let (ledger, drain) = RetryLedger::spawn(
        config.retry_threshold,
        replay_source,
        store.clone(),
        TagStripper::new(),
    );

    let source = HhClient::new(fetcher, config.api_base.clone())
        .with_failure_recorder(Arc::new(ledger.clone()));
    let pipeline = HarvestPipeline::new(Arc::new(source), store, config.rate_limit_backoff);

    Ok(Harvester {
        pipeline: Arc::new(pipeline),
        ledger,
        drain,
    })
}
