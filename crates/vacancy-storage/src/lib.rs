//! HTTP fetch utilities and the document store boundary.

mod elastic;
mod memory;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};
use vacancy_core::VacancyDocument;

pub use elastic::ElasticStore;
pub use memory::MemoryStore;
pub use reqwest::{StatusCode, Url};

pub const CRATE_NAME: &str = "vacancy-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Thin GET client. Non-2xx responses are returned, not turned into errors;
/// callers decide what a failed status means for them.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(query).build()?;
        let url = request.url().to_string();

        let span = info_span!("http_fetch", url = %url);
        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse { status, url, body })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub index: String,
    pub connect_attempts: usize,
    pub connect_delay: Duration,
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: vacancy_core::VACANCY_INDEX.to_string(),
            connect_attempts: 10,
            connect_delay: Duration::from_secs(4),
            timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("ES_HOST")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.url),
            ..defaults
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("document store returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("document store json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid document id {0:?}")]
    InvalidId(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub indexed: usize,
    pub failed: usize,
}

/// Search engine holding the enriched vacancies, keyed by vacancy id.
///
/// Writes are idempotent upserts. Reads hand back the stored source documents
/// untouched; relevance ordering is the store's business.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn bulk_upsert(&self, docs: &[VacancyDocument]) -> Result<BulkOutcome, StoreError>;

    async fn upsert_one(&self, doc: &VacancyDocument) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn search(&self, text: &str, size: usize) -> Result<Vec<JsonValue>, StoreError>;

    async fn all(&self, size: usize) -> Result<Vec<JsonValue>, StoreError>;

    async fn index_exists(&self, name: &str) -> Result<bool, StoreError>;
}
