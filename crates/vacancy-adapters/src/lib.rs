//! Remote listing API contract and the hh.ru-style adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;
use vacancy_core::{ListingDetail, ListingPage, RequestKind};
use vacancy_storage::{FetchError, FetchedResponse, HttpFetcher, StatusCode, Url};

pub const CRATE_NAME: &str = "vacancy-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.hh.ru";
pub const DEFAULT_USER_AGENT: &str = "Localhost 1.0";
pub const PAGE_SIZE: u32 = 25;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Receives requests that came back with a non-2xx status.
pub trait FailureRecorder: Send + Sync {
    fn record(&self, kind: RequestKind, url: &str);
}

/// Outcome of a detail fetch. `status` is `None` when the host was unreachable.
#[derive(Debug, Clone, Default)]
pub struct DetailFetch {
    pub status: Option<StatusCode>,
    pub detail: Option<ListingDetail>,
}

impl DetailFetch {
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(StatusCode::TOO_MANY_REQUESTS)
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(&self, term: &str, page: u32) -> Result<ListingPage, SourceError>;

    async fn fetch_detail(&self, id: &str) -> DetailFetch;

    /// Re-issues a GET for a url previously handed to a [`FailureRecorder`].
    async fn replay(&self, url: &str) -> Result<FetchedResponse, SourceError>;
}

#[derive(Clone)]
pub struct HhClient {
    fetcher: HttpFetcher,
    api_base: String,
    failures: Option<Arc<dyn FailureRecorder>>,
}

impl HhClient {
    pub fn new(fetcher: HttpFetcher, api_base: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            failures: None,
        }
    }

    pub fn with_failure_recorder(mut self, recorder: Arc<dyn FailureRecorder>) -> Self {
        self.failures = Some(recorder);
        self
    }

    /// `{api_base}/vacancies/{id}` with the id as one encoded path segment.
    fn detail_url(&self, id: &str) -> Option<Url> {
        if matches!(id, "" | "." | "..") {
            return None;
        }
        let mut url = Url::parse(&self.api_base).ok()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["vacancies", id]);
        Some(url)
    }

    fn note_failure(&self, kind: RequestKind, resp: &FetchedResponse) {
        warn!(status = %resp.status, url = %resp.url, ?kind, "listing api returned non-success status");
        if let Some(recorder) = &self.failures {
            recorder.record(kind, &resp.url);
        }
    }
}

pub fn decode_body<T: DeserializeOwned>(resp: &FetchedResponse) -> Result<T, SourceError> {
    serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
        url: resp.url.clone(),
        source,
    })
}

#[async_trait]
impl ListingSource for HhClient {
    async fn fetch_page(&self, term: &str, page: u32) -> Result<ListingPage, SourceError> {
        let url = format!("{}/vacancies", self.api_base);
        let per_page = PAGE_SIZE.to_string();
        let page = page.to_string();
        let resp = self
            .fetcher
            .get(
                &url,
                &[("text", term), ("per_page", per_page.as_str()), ("page", page.as_str())],
            )
            .await
            .inspect_err(|err| warn!(%url, error = %err, "listing page request failed"))?;

        if !resp.is_success() {
            self.note_failure(RequestKind::Page, &resp);
        }
        decode_body(&resp).inspect_err(|err| warn!(error = %err, "undecodable listing page"))
    }

    async fn fetch_detail(&self, id: &str) -> DetailFetch {
        let Some(url) = self.detail_url(id) else {
            warn!(id, api_base = %self.api_base, "cannot build a detail url for this id");
            return DetailFetch::default();
        };
        let resp = match self.fetcher.get(url.as_str(), &[]).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%url, error = %err, "vacancy detail request failed");
                return DetailFetch::default();
            }
        };

        if !resp.is_success() {
            self.note_failure(RequestKind::Detail, &resp);
        }
        // Error bodies decode into an id-less record; those cannot be stored.
        let detail = decode_body::<ListingDetail>(&resp)
            .inspect_err(|err| warn!(error = %err, "undecodable vacancy detail"))
            .ok()
            .filter(|detail| !detail.id.is_empty());

        DetailFetch {
            status: Some(resp.status),
            detail,
        }
    }

    async fn replay(&self, url: &str) -> Result<FetchedResponse, SourceError> {
        Ok(self.fetcher.get(url, &[]).await?)
    }
}
