use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use vacancy_core::VacancyDocument;

use crate::{BulkOutcome, DocumentStore, StoreError};

/// In-process document store for tests and local runs.
#[derive(Debug)]
pub struct MemoryStore {
    index: String,
    docs: Mutex<BTreeMap<String, VacancyDocument>>,
    bulk_writes: AtomicUsize,
    single_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(vacancy_core::VACANCY_INDEX)
    }
}

impl MemoryStore {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            docs: Mutex::new(BTreeMap::new()),
            bulk_writes: AtomicUsize::new(0),
            single_writes: AtomicUsize::new(0),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }

    pub async fn document(&self, id: &str) -> Option<VacancyDocument> {
        self.docs.lock().await.get(id).cloned()
    }

    pub fn bulk_writes(&self) -> usize {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    pub fn single_writes(&self) -> usize {
        self.single_writes.load(Ordering::SeqCst)
    }
}

fn haystack(doc: &VacancyDocument) -> String {
    format!(
        "{} {} {}",
        doc.name(),
        doc.description(),
        doc.key_skills().join(" ")
    )
    .to_lowercase()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn bulk_upsert(&self, docs: &[VacancyDocument]) -> Result<BulkOutcome, StoreError> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let mut stored = self.docs.lock().await;
        for doc in docs {
            stored.insert(doc.id().to_string(), doc.clone());
        }
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        Ok(BulkOutcome {
            indexed: docs.len(),
            failed: 0,
        })
    }

    async fn upsert_one(&self, doc: &VacancyDocument) -> Result<(), StoreError> {
        self.docs
            .lock()
            .await
            .insert(doc.id().to_string(), doc.clone());
        self.single_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<JsonValue>, StoreError> {
        let docs = self.docs.lock().await;
        docs.get(id)
            .map(serde_json::to_value)
            .transpose()
            .map_err(StoreError::from)
    }

    /// Scores by the number of query terms found in name, description or skills.
    async fn search(&self, text: &str, size: usize) -> Result<Vec<JsonValue>, StoreError> {
        let terms = text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>();
        let docs = self.docs.lock().await;

        let mut scored = docs
            .values()
            .filter_map(|doc| {
                let hay = haystack(doc);
                let score = terms.iter().filter(|t| hay.contains(t.as_str())).count();
                (score > 0).then_some((score, doc))
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        scored
            .into_iter()
            .take(size)
            .map(|(_, doc)| serde_json::to_value(doc).map_err(StoreError::from))
            .collect()
    }

    async fn all(&self, size: usize) -> Result<Vec<JsonValue>, StoreError> {
        let docs = self.docs.lock().await;
        docs.values()
            .take(size)
            .map(|doc| serde_json::to_value(doc).map_err(StoreError::from))
            .collect()
    }

    async fn index_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(name == self.index && !self.docs.lock().await.is_empty())
    }
}
