use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use vacancy_core::VacancyDocument;

use crate::{BulkOutcome, DocumentStore, StoreConfig, StoreError};

const SEARCH_FIELDS: [&str; 3] = ["description", "name", "key_skills"];

/// Elasticsearch over its REST API.
#[derive(Debug, Clone)]
pub struct ElasticStore {
    client: reqwest::Client,
    base_url: Url,
    index: String,
}

impl ElasticStore {
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building elasticsearch client")?;
        let base_url = Url::parse(&config.url)
            .with_context(|| format!("parsing elasticsearch url {}", config.url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("elasticsearch url {} cannot carry a path", config.url);
        }
        Ok(Self {
            client,
            base_url,
            index: config.index.clone(),
        })
    }

    /// Builds the client and pings until the cluster answers or the attempts
    /// run out. An unreachable cluster still yields a store; calls against it
    /// fail and get logged by their callers.
    pub async fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        let store = Self::new(config)?;
        let attempts = config.connect_attempts.max(1);

        for attempt in 1..=attempts {
            info!(url = %store.base_url, attempt, "connecting to elasticsearch");
            match store.ping().await {
                Ok(()) => {
                    info!(url = %store.base_url, "elasticsearch connection established");
                    return Ok(store);
                }
                Err(err) => warn!(url = %store.base_url, attempt, error = %err, "elasticsearch ping failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(config.connect_delay).await;
            }
        }

        warn!(url = %store.base_url, attempts, "continuing without a confirmed elasticsearch connection");
        Ok(store)
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let url = self.endpoint(&[]);
        let resp = self.client.get(url.clone()).send().await?;
        ensure_success(resp.status(), &url)
    }

    /// Appends each segment percent-encoded, so a segment can never add
    /// path levels of its own.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn doc_url(&self, id: &str) -> Result<Url, StoreError> {
        if !is_valid_doc_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.endpoint(&[self.index.as_str(), "_doc", id]))
    }

    async fn query_sources(&self, body: JsonValue) -> Result<Vec<JsonValue>, StoreError> {
        let url = self.endpoint(&[self.index.as_str(), "_search"]);
        let resp = self.client.post(url.clone()).json(&body).send().await?;
        ensure_success(resp.status(), &url)?;
        let value: JsonValue = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(hit_sources(&value))
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn bulk_upsert(&self, docs: &[VacancyDocument]) -> Result<BulkOutcome, StoreError> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let mut body = String::new();
        for doc in docs {
            body.push_str(&serde_json::to_string(&json!({ "index": { "_id": doc.id() } }))?);
            body.push('\n');
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
        }

        let url = self.endpoint(&[self.index.as_str(), "_bulk"]);
        let resp = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        ensure_success(resp.status(), &url)?;

        let value: JsonValue = serde_json::from_slice(&resp.bytes().await?)?;
        let outcome = bulk_outcome(&value, docs.len());
        if outcome.failed > 0 {
            warn!(index = %self.index, failed = outcome.failed, "bulk request reported item errors");
        }
        Ok(outcome)
    }

    async fn upsert_one(&self, doc: &VacancyDocument) -> Result<(), StoreError> {
        let url = self.doc_url(doc.id())?;
        let resp = self.client.put(url.clone()).json(doc).send().await?;
        ensure_success(resp.status(), &url)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<JsonValue>, StoreError> {
        if !is_valid_doc_id(id) {
            return Ok(None);
        }
        let url = self.doc_url(id)?;
        let resp = self.client.get(url.clone()).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ensure_success(resp.status(), &url)?;

        let mut value: JsonValue = serde_json::from_slice(&resp.bytes().await?)?;
        if value.get("found").and_then(JsonValue::as_bool) == Some(false) {
            return Ok(None);
        }
        Ok(value.get_mut("_source").map(JsonValue::take))
    }

    async fn search(&self, text: &str, size: usize) -> Result<Vec<JsonValue>, StoreError> {
        self.query_sources(json!({
            "size": size,
            "query": {
                "multi_match": {
                    "query": text,
                    "fields": SEARCH_FIELDS,
                }
            }
        }))
        .await
    }

    async fn all(&self, size: usize) -> Result<Vec<JsonValue>, StoreError> {
        self.query_sources(json!({
            "size": size,
            "query": { "match_all": {} }
        }))
        .await
    }

    async fn index_exists(&self, name: &str) -> Result<bool, StoreError> {
        let url = self.endpoint(&[name]);
        let resp = self.client.head(url.clone()).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status => ensure_success(status, &url).map(|()| true),
        }
    }
}

/// Dot segments are resolved by URL normalization even when encoded alone.
fn is_valid_doc_id(id: &str) -> bool {
    !matches!(id, "" | "." | "..")
}

fn ensure_success(status: StatusCode, url: &Url) -> Result<(), StoreError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(StoreError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

fn hit_sources(response: &JsonValue) -> Vec<JsonValue> {
    response
        .pointer("/hits/hits")
        .and_then(JsonValue::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_source").cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn bulk_outcome(response: &JsonValue, submitted: usize) -> BulkOutcome {
    if response.get("errors").and_then(JsonValue::as_bool) != Some(true) {
        return BulkOutcome {
            indexed: submitted,
            failed: 0,
        };
    }
    let failed = response
        .get("items")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.pointer("/index/error").is_some())
                .count()
        })
        .unwrap_or(submitted);
    BulkOutcome {
        indexed: submitted.saturating_sub(failed),
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vacancy_core::{ListingDetail, TagStripper};
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> ElasticStore {
        ElasticStore::new(&StoreConfig {
            url: server.uri(),
            ..Default::default()
        })
        .unwrap()
    }

    fn doc(id: &str, description: &str) -> VacancyDocument {
        VacancyDocument::from_detail(
            ListingDetail {
                id: id.into(),
                name: format!("vacancy {id}"),
                description: description.into(),
                key_skills: Default::default(),
            },
            &TagStripper::new(),
        )
    }

    #[tokio::test]
    async fn bulk_upsert_sends_ndjson_keyed_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/full_vacancies/_bulk"))
            .and(header("content-type", "application/x-ndjson"))
            .and(body_string_contains(r#"{"index":{"_id":"42"}}"#))
            .and(body_string_contains(r#""description":"Go dev""#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 3,
                "errors": false,
                "items": [{"index": {"_id": "42", "status": 201}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = store_for(&server)
            .bulk_upsert(&[doc("42", "<p>Go <b>dev</b></p>")])
            .await
            .unwrap();
        assert_eq!(outcome, BulkOutcome { indexed: 1, failed: 0 });
    }

    #[tokio::test]
    async fn bulk_upsert_counts_item_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/full_vacancies/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    {"index": {"_id": "1", "status": 201}},
                    {"index": {"_id": "2", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
                ]
            })))
            .mount(&server)
            .await;

        let outcome = store_for(&server)
            .bulk_upsert(&[doc("1", "a"), doc("2", "b")])
            .await
            .unwrap();
        assert_eq!(outcome, BulkOutcome { indexed: 1, failed: 1 });
    }

    #[tokio::test]
    async fn empty_bulk_does_not_hit_the_cluster() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let outcome = store_for(&server).bulk_upsert(&[]).await.unwrap();
        assert_eq!(outcome, BulkOutcome::default());
    }

    #[tokio::test]
    async fn get_by_id_maps_missing_documents_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/full_vacancies/_doc/404"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/full_vacancies/_doc/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_id": "7",
                "found": true,
                "_source": {"id": "7", "name": "Rust"}
            })))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(store.get_by_id("404").await.unwrap(), None);
        assert_eq!(
            store.get_by_id("7").await.unwrap(),
            Some(json!({"id": "7", "name": "Rust"}))
        );
    }

    #[tokio::test]
    async fn document_ids_stay_inside_the_vacancy_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secrets/_doc/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "found": true,
                "_source": {"token": "s3cr3t"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(store.get_by_id("../../secrets/_doc/1").await.unwrap(), None);
        assert_eq!(store.get_by_id("1?x=1#frag").await.unwrap(), None);
        assert_eq!(store.get_by_id("..").await.unwrap(), None);

        let paths = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .map(|req| req.url.path().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                "/full_vacancies/_doc/..%2F..%2Fsecrets%2F_doc%2F1".to_string(),
                "/full_vacancies/_doc/1%3Fx=1%23frag".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn upsert_one_rejects_dot_segment_ids() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = store_for(&server).upsert_one(&doc("..", "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(id) if id == ".."));
    }

    #[tokio::test]
    async fn search_uses_multi_match_over_vacancy_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/full_vacancies/_search"))
            .and(body_partial_json(json!({
                "size": 5,
                "query": {"multi_match": {"query": "golang", "fields": ["description", "name", "key_skills"]}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [
                    {"_id": "2", "_source": {"id": "2"}},
                    {"_id": "1", "_source": {"id": "1"}}
                ]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hits = store_for(&server).search("golang", 5).await.unwrap();
        assert_eq!(hits, vec![json!({"id": "2"}), json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn index_exists_reads_head_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/full_vacancies"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/other"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(store.index_exists("full_vacancies").await.unwrap());
        assert!(!store.index_exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn connect_gives_up_after_fixed_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let store = ElasticStore::connect(&StoreConfig {
            url: server.uri(),
            connect_attempts: 3,
            connect_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(store.index(), "full_vacancies");
    }
}
