//! Seeding of the shared knowledge collection from a static JSON corpus.
//!
//! The corpus is a JSON array of `{"page_content": "...", "metadata": {...}}` records; each
//! record becomes one passage. Seeding is idempotent against the store: a collection that
//! already holds passages is left untouched and nothing is written.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::embedding::{EmbeddingClient, EmbeddingClientError};
use crate::store::{PassageInsert, StoreError, VectorStore};

const EMBED_BATCH_SIZE: usize = 32;

/// Errors raised while seeding the global collection.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Corpus file exists but could not be read.
    #[error("Failed to read knowledge corpus: {0}")]
    Read(#[from] std::io::Error),
    /// Corpus is not a JSON array of records.
    #[error("Knowledge corpus is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// Embedding collaborator failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Store could not be queried or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a seeding run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Collection already held this many passages; nothing was written.
    AlreadyPopulated(usize),
    /// Corpus file was not found.
    SourceMissing,
    /// Corpus held no usable records.
    NoRecords,
    /// Passages were written.
    Ingested {
        /// Passages written.
        written: usize,
        /// Records dropped for lacking `page_content`.
        skipped: usize,
    },
}

#[derive(Debug, Deserialize)]
struct CorpusRecord {
    page_content: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Populate `collection` from the corpus at `path` unless it already holds data.
pub async fn seed_global_knowledge(
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingClient,
    collection: &str,
    path: &Path,
) -> Result<SeedOutcome, KnowledgeError> {
    if store.collection_exists(collection).await? {
        let existing = store.count(collection).await?;
        if existing > 0 {
            tracing::info!(collection, existing, "Global knowledge already present; skipping");
            return Ok(SeedOutcome::AlreadyPopulated(existing));
        }
    }

    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Knowledge corpus not found; skipping");
            return Ok(SeedOutcome::SourceMissing);
        }
        Err(error) => return Err(error.into()),
    };
    let records: Vec<CorpusRecord> = serde_json::from_slice(&raw)?;
    let total = records.len();

    let usable: Vec<(String, Map<String, Value>)> = records
        .into_iter()
        .filter_map(|record| {
            let text = record.page_content.filter(|text| !text.trim().is_empty())?;
            let metadata = match record.metadata {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            Some((text, metadata))
        })
        .collect();
    let skipped = total - usable.len();
    if usable.is_empty() {
        tracing::warn!(path = %path.display(), "Knowledge corpus has no page_content records");
        return Ok(SeedOutcome::NoRecords);
    }

    store
        .ensure_collection(collection, embedder.dimension())
        .await?;

    let mut written = 0;
    for batch in usable.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|(text, _)| text.clone()).collect();
        let vectors = embedder.generate_embeddings(texts).await?;
        let passages = batch
            .iter()
            .cloned()
            .zip(vectors)
            .map(|((text, metadata), vector)| PassageInsert {
                text,
                vector,
                metadata,
            })
            .collect();
        written += store.upsert(collection, passages).await?;
    }

    tracing::info!(collection, written, skipped, "Global knowledge ingested");
    Ok(SeedOutcome::Ingested { written, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingClient;
    use crate::store::InMemoryStore;

    fn corpus(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("data.json");
        std::fs::write(&path, body).expect("write corpus");
        path
    }

    #[tokio::test]
    async fn ingests_records_and_skips_incomplete_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = corpus(
            dir.path(),
            r#"[
                {"page_content": "Office hours are on Tuesday.", "metadata": {"dept": "cs"}},
                {"metadata": {"dept": "ee"}},
                {"page_content": "The library closes at 9pm."}
            ]"#,
        );
        let store = InMemoryStore::new();
        let embedder = HashEmbeddingClient::new(8);

        let outcome = seed_global_knowledge(&store, &embedder, "static_json_knowledge", &path)
            .await
            .expect("seed");

        assert_eq!(outcome, SeedOutcome::Ingested { written: 2, skipped: 1 });
        let hits = store
            .search("static_json_knowledge", vec![1.0; 8], 5)
            .await
            .expect("search");
        assert!(hits.iter().any(|hit| hit.metadata.get("dept") == Some(&Value::from("cs"))));
    }

    #[tokio::test]
    async fn rerun_on_populated_collection_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = corpus(dir.path(), r#"[{"page_content": "one"}, {"page_content": "two"}]"#);
        let store = InMemoryStore::new();
        let embedder = HashEmbeddingClient::new(8);

        seed_global_knowledge(&store, &embedder, "global", &path)
            .await
            .expect("first run");
        let writes_after_first = store.writes();

        let outcome = seed_global_knowledge(&store, &embedder, "global", &path)
            .await
            .expect("second run");
        assert_eq!(outcome, SeedOutcome::AlreadyPopulated(2));
        assert_eq!(store.writes(), writes_after_first);
    }

    #[tokio::test]
    async fn missing_corpus_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = InMemoryStore::new();
        let outcome = seed_global_knowledge(
            &store,
            &HashEmbeddingClient::new(8),
            "global",
            &dir.path().join("absent.json"),
        )
        .await
        .expect("seed");
        assert_eq!(outcome, SeedOutcome::SourceMissing);
        assert!(!store.collection_exists("global").await.expect("exists"));
    }

    #[tokio::test]
    async fn malformed_corpus_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = corpus(dir.path(), r#"{"page_content": "not an array"}"#);
        let result =
            seed_global_knowledge(&InMemoryStore::new(), &HashEmbeddingClient::new(8), "g", &path)
                .await;
        assert!(matches!(result, Err(KnowledgeError::Parse(_))));
    }
}
