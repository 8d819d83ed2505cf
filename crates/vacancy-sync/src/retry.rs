//! Ledger of failed remote requests and the worker that replays them.
//!
//! The ledger keeps failed urls keyed by url. Once it holds more than
//! `threshold` entries, the whole map is swapped out for an empty one and
//! handed to the drain worker, which replays every entry and writes whatever
//! comes back into the document store. Replays that fail again are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vacancy_adapters::{decode_body, FailureRecorder, ListingSource, SourceError};
use vacancy_core::{FailedRequest, ListingDetail, ListingPage, RequestKind, TagStripper, VacancyDocument};
use vacancy_storage::DocumentStore;

pub const DEFAULT_RETRY_THRESHOLD: usize = 10;

type Batch = HashMap<String, RequestKind>;

#[derive(Clone)]
pub struct RetryLedger {
    pending: Arc<Mutex<Batch>>,
    threshold: usize,
    batches: mpsc::UnboundedSender<Batch>,
}

/// Owns the drain worker task.
pub struct DrainHandle {
    shutdown: CancellationToken,
    task: JoinHandle<DrainStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub drains: usize,
    pub entries: usize,
    pub replayed: usize,
    pub failed: usize,
    pub stored: usize,
}

impl RetryLedger {
    /// Starts the drain worker. `source` is used for replays and must not
    /// report back into this ledger.
    pub fn spawn(
        threshold: usize,
        source: Arc<dyn ListingSource>,
        store: Arc<dyn DocumentStore>,
        stripper: TagStripper,
    ) -> (Self, DrainHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = DrainWorker {
            source,
            store,
            stripper,
            stats: DrainStats::default(),
        };
        let task = tokio::spawn(worker.run(rx, shutdown.clone()));

        let ledger = Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            threshold,
            batches: tx,
        };
        (ledger, DrainHandle { shutdown, task })
    }

    pub fn record(&self, kind: RequestKind, url: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(url.to_string(), kind);
        debug!(url, ?kind, pending = pending.len(), "recorded failed request");

        if pending.len() > self.threshold {
            let batch = std::mem::take(&mut *pending);
            if let Err(err) = self.batches.send(batch) {
                warn!(dropped = err.0.len(), "drain worker stopped; dropping failed requests");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> Vec<FailedRequest> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = pending
            .iter()
            .map(|(url, kind)| FailedRequest {
                url: url.clone(),
                kind: *kind,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        out
    }
}

impl FailureRecorder for RetryLedger {
    fn record(&self, kind: RequestKind, url: &str) {
        RetryLedger::record(self, kind, url);
    }
}

impl DrainHandle {
    /// Finishes every batch already handed over, then stops the worker.
    pub async fn shutdown(self) -> DrainStats {
        self.shutdown.cancel();
        match self.task.await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "drain worker did not finish cleanly");
                DrainStats::default()
            }
        }
    }
}

struct DrainWorker {
    source: Arc<dyn ListingSource>,
    store: Arc<dyn DocumentStore>,
    stripper: TagStripper,
    stats: DrainStats,
}

impl DrainWorker {
    async fn run(
        mut self,
        mut batches: mpsc::UnboundedReceiver<Batch>,
        shutdown: CancellationToken,
    ) -> DrainStats {
        loop {
            tokio::select! {
                biased;
                batch = batches.recv() => match batch {
                    Some(batch) => self.drain(batch).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    while let Ok(batch) = batches.try_recv() {
                        self.drain(batch).await;
                    }
                    break;
                }
            }
        }
        self.stats
    }

    async fn drain(&mut self, batch: Batch) {
        info!(entries = batch.len(), "replaying failed requests");
        self.stats.drains += 1;
        self.stats.entries += batch.len();
        let before = self.stats;

        for (url, kind) in batch {
            let resp = match self.source.replay(&url).await {
                Ok(resp) if resp.is_success() => resp,
                Ok(resp) => {
                    warn!(%url, status = %resp.status, "replay failed again; dropping");
                    self.stats.failed += 1;
                    continue;
                }
                Err(err) => {
                    warn!(%url, error = %err, "replay failed again; dropping");
                    self.stats.failed += 1;
                    continue;
                }
            };
            self.stats.replayed += 1;

            match kind {
                RequestKind::Page => self.restore_page(&url, decode_body(&resp)).await,
                RequestKind::Detail => self.restore_detail(&url, decode_body(&resp)).await,
            }
        }

        info!(
            replayed = self.stats.replayed - before.replayed,
            failed = self.stats.failed - before.failed,
            stored = self.stats.stored - before.stored,
            "drain finished"
        );
    }

    async fn restore_page(&mut self, url: &str, page: Result<ListingPage, SourceError>) {
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                warn!(url, error = %err, "replayed page is undecodable");
                return;
            }
        };

        let mut docs = Vec::with_capacity(page.items.len());
        for item in &page.items {
            if let Some(detail) = self.source.fetch_detail(&item.id).await.detail {
                docs.push(VacancyDocument::from_detail(detail, &self.stripper));
            }
        }

        match self.store.bulk_upsert(&docs).await {
            Ok(outcome) => self.stats.stored += outcome.indexed,
            Err(err) => warn!(url, error = %err, "storing replayed page failed"),
        }
    }

    async fn restore_detail(&mut self, url: &str, detail: Result<ListingDetail, SourceError>) {
        let detail = match detail {
            Ok(detail) if !detail.id.is_empty() => detail,
            Ok(_) => {
                warn!(url, "replayed vacancy has no id");
                return;
            }
            Err(err) => {
                warn!(url, error = %err, "replayed vacancy is undecodable");
                return;
            }
        };

        let doc = VacancyDocument::from_detail(detail, &self.stripper);
        match self.store.upsert_one(&doc).await {
            Ok(()) => self.stats.stored += 1,
            Err(err) => warn!(url, error = %err, "storing replayed vacancy failed"),
        }
    }
}
