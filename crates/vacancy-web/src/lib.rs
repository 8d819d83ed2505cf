//! Axum read API over the document store, plus the harvest trigger.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vacancy_storage::DocumentStore;
use vacancy_sync::HarvestPipeline;

pub const CRATE_NAME: &str = "vacancy-web";

pub const DEFAULT_RESULT_SIZE: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub pipeline: Arc<HarvestPipeline>,
    pub default_term: String,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pipeline: Arc<HarvestPipeline>,
        default_term: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pipeline,
            default_term: default_term.into(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    text: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HarvestQuery {
    text: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/vacancies", get(search_handler))
        .route("/vacancies/{id}", get(vacancy_handler))
        .route("/parse-vacancies", get(harvest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving vacancy api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Numeric ids are looked up directly; anything else is served as a search.
async fn vacancy_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    if id.parse::<u64>().is_err() {
        return search(&state, query).await;
    }
    match state.store.get_by_id(&id).await {
        Ok(Some(doc)) => Json(doc).into_response(),
        Ok(None) => not_found(),
        Err(err) => {
            warn!(%id, error = %err, "vacancy lookup failed");
            not_found()
        }
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    search(&state, query).await
}

async fn search(state: &AppState, query: SearchQuery) -> Response {
    let size = query
        .size
        .as_deref()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_RESULT_SIZE);
    let text = query.text.unwrap_or_default();

    let result = if text.is_empty() {
        state.store.all(size).await
    } else {
        state.store.search(&text, size).await
    };

    match result {
        Ok(docs) if !docs.is_empty() => Json(JsonValue::Array(docs)).into_response(),
        Ok(_) => not_found(),
        Err(err) => {
            warn!(%text, error = %err, "vacancy search failed");
            not_found()
        }
    }
}

async fn harvest_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HarvestQuery>,
) -> Response {
    let term = query
        .text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| state.default_term.clone());
    state
        .pipeline
        .harvest_with_cancel(&term, state.shutdown.child_token())
        .await;
    Json(json!({"message": "ok"})).into_response()
}

fn not_found() -> Response {
    Json(json!({"message": "not found"})).into_response()
}
