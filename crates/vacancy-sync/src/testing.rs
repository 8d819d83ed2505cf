//! Scripted listing source shared by the pipeline and ledger tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;
use vacancy_adapters::{DetailFetch, ListingSource, SourceError};
use vacancy_core::{ListingDetail, ListingPage, ListingSummary};
use vacancy_storage::{FetchedResponse, StatusCode};

const BASE: &str = "https://api.test/vacancies";

pub fn detail_url(id: &str) -> String {
    format!("{BASE}/{id}")
}

pub fn page_url(page: u32) -> String {
    format!("{BASE}?text=go&per_page=25&page={page}")
}

/// `pages` pages of `per_page` items each; item ids are `"{page}-{n}"`.
pub struct ScriptedSource {
    pages: u32,
    per_page: usize,
    rate_limited: HashSet<String>,
    unreachable: HashSet<String>,
    page_down: bool,
    replay_status: StatusCode,
    pub page_calls: Mutex<Vec<u32>>,
    pub detail_calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedSource {
    pub fn new(pages: u32, per_page: usize) -> Self {
        Self {
            pages,
            per_page,
            rate_limited: HashSet::new(),
            unreachable: HashSet::new(),
            page_down: false,
            replay_status: StatusCode::OK,
            page_calls: Mutex::new(Vec::new()),
            detail_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rate_limited(mut self, ids: &[&str]) -> Self {
        self.rate_limited.extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn with_unreachable(mut self, ids: &[&str]) -> Self {
        self.unreachable.extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn with_pages_down(mut self) -> Self {
        self.page_down = true;
        self
    }

    pub fn with_replay_status(mut self, status: StatusCode) -> Self {
        self.replay_status = status;
        self
    }

    pub fn all_ids(&self) -> Vec<String> {
        (0..self.pages)
            .flat_map(|page| (0..self.per_page).map(move |n| format!("{page}-{n}")))
            .collect()
    }

    fn page(&self, page: u32) -> ListingPage {
        ListingPage {
            items: (0..self.per_page)
                .map(|n| ListingSummary {
                    id: format!("{page}-{n}"),
                    name: format!("Go developer {page}-{n}"),
                })
                .collect(),
            page,
            total_pages: self.pages,
            total_found: self.pages as u64 * self.per_page as u64,
            per_page: self.per_page as u32,
        }
    }

    fn detail(id: &str) -> ListingDetail {
        ListingDetail {
            id: id.to_string(),
            name: format!("Go developer {id}"),
            description: "<p>Go <b>dev</b></p>".to_string(),
            key_skills: ["Go".to_string()].into_iter().collect(),
        }
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    async fn fetch_page(&self, _term: &str, page: u32) -> Result<ListingPage, SourceError> {
        self.page_calls.lock().unwrap().push(page);
        if self.page_down {
            let err = serde_json::from_str::<ListingPage>("<html>").unwrap_err();
            return Err(SourceError::Decode {
                url: page_url(page),
                source: err,
            });
        }
        Ok(self.page(page))
    }

    async fn fetch_detail(&self, id: &str) -> DetailFetch {
        self.detail_calls
            .lock()
            .unwrap()
            .push((id.to_string(), Instant::now()));
        if self.unreachable.contains(id) {
            return DetailFetch::default();
        }
        if self.rate_limited.contains(id) {
            return DetailFetch {
                status: Some(StatusCode::TOO_MANY_REQUESTS),
                detail: None,
            };
        }
        DetailFetch {
            status: Some(StatusCode::OK),
            detail: Some(Self::detail(id)),
        }
    }

    async fn replay(&self, url: &str) -> Result<FetchedResponse, SourceError> {
        let body = match url.strip_prefix(&format!("{BASE}/")) {
            Some(id) => serde_json::json!({
                "id": id,
                "name": format!("Go developer {id}"),
                "description": "<p>Go <b>dev</b></p>",
                "key_skills": [{"name": "Go"}]
            }),
            None => {
                let page = url
                    .rsplit("page=")
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                serde_json::to_value(self.page(page)).unwrap()
            }
        };
        Ok(FetchedResponse {
            status: self.replay_status,
            url: url.to_string(),
            body: serde_json::to_vec(&body).unwrap(),
        })
    }
}
