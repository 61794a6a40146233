//! In-memory [`VectorStore`] implementation for tests and offline runs.
//!
//! Collections are `Vec`s behind a `std::sync::RwLock`. Search is brute-force cosine
//! similarity. The store can be switched offline to exercise unreachable-store paths.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Passage, PassageInsert, StoreError, VectorStore};

struct StoredPassage {
    text: String,
    vector: Vec<f32>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Vec<StoredPassage>>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the engine becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of passages written since creation.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("in-memory store lock poisoned".into())
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        Ok(collections.contains_key(name))
    }

    async fn ensure_collection(&self, name: &str, _vector_size: usize) -> Result<(), StoreError> {
        self.check_online()?;
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        Ok(collections.remove(name).is_some())
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        Ok(collections.get(name).map(Vec::len).unwrap_or(0))
    }

    async fn upsert(&self, name: &str, passages: Vec<PassageInsert>) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let stored = collections.entry(name.to_string()).or_default();
        let written = passages.len();
        stored.extend(passages.into_iter().map(|passage| StoredPassage {
            text: passage.text,
            vector: passage.vector,
            metadata: passage.metadata,
        }));
        self.writes.fetch_add(written, Ordering::SeqCst);
        Ok(written)
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<Passage>, StoreError> {
        self.check_online()?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        let Some(stored) = collections.get(name) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<Passage> = stored
            .iter()
            .map(|passage| Passage {
                collection: name.to_string(),
                text: passage.text.clone(),
                score: cosine_sim(&vector, &passage.vector),
                metadata: passage.metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn passage(text: &str, vector: Vec<f32>) -> PassageInsert {
        PassageInsert {
            text: text.into(),
            vector,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn search_orders_by_similarity_and_limits() {
        let store = InMemoryStore::new();
        store
            .upsert(
                "docs",
                vec![
                    passage("far", vec![0.0, 1.0]),
                    passage("near", vec![1.0, 0.0]),
                    passage("middle", vec![0.7, 0.7]),
                ],
            )
            .await
            .expect("upsert");

        let hits = store.search("docs", vec![1.0, 0.0], 2).await.expect("search");
        let texts: Vec<&str> = hits.iter().map(|hit| hit.text.as_str()).collect();
        assert_eq!(texts, vec!["near", "middle"]);
        assert!(hits.iter().all(|hit| hit.collection == "docs"));
    }

    #[tokio::test]
    async fn offline_store_rejects_operations() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.list_collections().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.list_collections().await.expect("online").is_empty());
    }

    #[tokio::test]
    async fn delete_reports_prior_existence() {
        let store = InMemoryStore::new();
        store.ensure_collection("a", 2).await.expect("create");
        assert!(store.delete_collection("a").await.expect("delete"));
        assert!(!store.delete_collection("a").await.expect("delete"));
    }
}
