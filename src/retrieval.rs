//! Hybrid retrieval over the global knowledge collection and one tenant collection.
//!
//! The query is embedded once and both sources are searched concurrently, each returning its
//! own top-k. Results are concatenated global first, tenant second. Scores from the two
//! sources are not compared; source order is the ranking contract.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::embedding::{EmbeddingClient, EmbeddingClientError};
use crate::store::{Passage, StoreError, VectorStore};

/// Retrieval failures.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// No source could be reached.
    #[error("No retrieval source is reachable: {0}")]
    Unavailable(String),
    /// Query embedding failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
}

/// Passages for one query, in source-priority order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    /// Global passages followed by tenant passages.
    pub passages: Vec<Passage>,
    /// Collections that were actually searched.
    pub searched: Vec<String>,
}

impl RetrievalResult {
    /// Whether the search found nothing.
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// Fans a query out to the global and tenant collections.
#[derive(Clone)]
pub struct HybridRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    global_collection: String,
    top_k: usize,
}

impl HybridRetriever {
    /// Create a retriever returning `top_k` passages per source.
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        global_collection: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            global_collection: global_collection.into(),
            top_k: top_k.max(1),
        }
    }

    /// Retrieve passages for `query`, adding `tenant_collection` when it exists.
    ///
    /// A tenant collection that does not exist yet is skipped silently. The call fails with
    /// [`RetrievalError::Unavailable`] only when every source it tried returned an error.
    pub async fn retrieve(
        &self,
        query: &str,
        tenant_collection: Option<&str>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let vector = self
            .embedder
            .generate_embeddings(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EmbeddingClientError::GenerationFailed("no vector returned for query".into())
            })?;

        let global = self.search_if_exists(&self.global_collection, vector.clone());
        let tenant = async {
            match tenant_collection {
                Some(name) => Some(self.search_if_exists(name, vector.clone()).await),
                None => None,
            }
        };
        let (global, tenant) = tokio::join!(global, tenant);

        let mut result = RetrievalResult::default();
        let mut failures = Vec::new();
        for (name, outcome) in std::iter::once((self.global_collection.as_str(), Some(global)))
            .chain(tenant_collection.map(|name| (name, tenant)))
        {
            match outcome {
                Some(Ok(Some(passages))) => {
                    result.searched.push(name.to_string());
                    result.passages.extend(passages);
                }
                Some(Ok(None)) | None => {}
                Some(Err(error)) => {
                    tracing::warn!(collection = name, error = %error, "Retrieval source failed");
                    failures.push(format!("{name}: {error}"));
                }
            }
        }

        let attempted = 1 + usize::from(tenant_collection.is_some());
        if failures.len() == attempted {
            return Err(RetrievalError::Unavailable(failures.join("; ")));
        }
        Ok(result)
    }

    async fn search_if_exists(
        &self,
        collection: &str,
        vector: Vec<f32>,
    ) -> Result<Option<Vec<Passage>>, StoreError> {
        if !self.store.collection_exists(collection).await? {
            return Ok(None);
        }
        self.store
            .search(collection, vector, self.top_k)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingClient;
    use crate::store::{InMemoryStore, PassageInsert};
    use async_trait::async_trait;
    use serde_json::Map;

    const DIM: usize = 8;

    async fn seed(store: &InMemoryStore, collection: &str, texts: &[&str]) {
        let embedder = HashEmbeddingClient::new(DIM);
        let vectors = embedder
            .generate_embeddings(texts.iter().map(|t| t.to_string()).collect())
            .await
            .expect("embed");
        let passages = texts
            .iter()
            .zip(vectors)
            .map(|(text, vector)| PassageInsert {
                text: text.to_string(),
                vector,
                metadata: Map::new(),
            })
            .collect();
        store.upsert(collection, passages).await.expect("upsert");
    }

    fn retriever(store: Arc<InMemoryStore>) -> HybridRetriever {
        HybridRetriever::new(store, Arc::new(HashEmbeddingClient::new(DIM)), "global", 3)
    }

    #[tokio::test]
    async fn global_only_without_tenant() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["campus map", "library hours"]).await;
        seed(&store, "u_alice_Syllabus", &["grading policy"]).await;

        let result = retriever(store).retrieve("hours", None).await.expect("retrieve");
        assert_eq!(result.searched, vec!["global"]);
        assert!(result.passages.iter().all(|p| p.collection == "global"));
        assert_eq!(result.passages.len(), 2);
    }

    #[tokio::test]
    async fn missing_tenant_collection_matches_global_only() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["campus map", "library hours"]).await;
        let retriever = retriever(store);

        let without = retriever.retrieve("map", None).await.expect("retrieve");
        let with_missing = retriever
            .retrieve("map", Some("nonexistent"))
            .await
            .expect("retrieve");
        let texts = |r: &RetrievalResult| -> Vec<String> {
            r.passages.iter().map(|p| p.text.clone()).collect()
        };
        assert_eq!(texts(&without), texts(&with_missing));
        assert_eq!(with_missing.searched, vec!["global"]);
    }

    #[tokio::test]
    async fn global_passages_precede_tenant_passages() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["a", "b", "c", "d"]).await;
        seed(&store, "u_alice_Syllabus", &["grading policy", "late work"]).await;

        let result = retriever(store)
            .retrieve("grading policy", Some("u_alice_Syllabus"))
            .await
            .expect("retrieve");
        let sources: Vec<&str> = result.passages.iter().map(|p| p.collection.as_str()).collect();
        assert_eq!(
            sources,
            vec!["global", "global", "global", "u_alice_Syllabus", "u_alice_Syllabus"]
        );
    }

    #[tokio::test]
    async fn unreachable_store_is_unavailable_not_empty() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["a"]).await;
        store.set_offline(true);

        let result = retriever(store).retrieve("a", Some("u_alice_x")).await;
        assert!(matches!(result, Err(RetrievalError::Unavailable(_))));
    }

    #[tokio::test]
    async fn empty_store_is_found_nothing() {
        let result = retriever(Arc::new(InMemoryStore::new()))
            .retrieve("anything", None)
            .await
            .expect("retrieve");
        assert!(result.is_empty());
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingClient for BrokenEmbedder {
        async fn generate_embeddings(
            &self,
            _texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Err(EmbeddingClientError::ProviderUnavailable("down".into()))
        }

        fn dimension(&self) -> usize {
            DIM
        }
    }

    #[tokio::test]
    async fn embedding_failure_is_a_collaborator_error() {
        let retriever = HybridRetriever::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(BrokenEmbedder),
            "global",
            3,
        );
        assert!(matches!(
            retriever.retrieve("q", None).await,
            Err(RetrievalError::Embedding(_))
        ));
    }
}
