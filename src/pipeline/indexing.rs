//! Native indexing stage: chunk, embed, and write the tenant collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::chunking::{ChunkingSettings, chunk_text, dedupe_chunks};
use super::{IngestionJob, Stage, StageError};
use crate::embedding::EmbeddingClient;
use crate::metrics::PipelineMetrics;
use crate::qdrant::current_timestamp_rfc3339;
use crate::store::{PassageInsert, VectorStore};

const EMBED_BATCH_SIZE: usize = 32;
const STAGE_NAME: &str = "indexing";

/// Indexes enriched markdown into the job's collection.
///
/// An existing collection with the same name is replaced, so re-uploading a document never
/// mixes passages from two versions.
pub struct IndexingStage {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    settings: ChunkingSettings,
    metrics: Arc<PipelineMetrics>,
}

impl IndexingStage {
    /// Create the stage over the shared store and embedding client.
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        settings: ChunkingSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            embedder,
            settings,
            metrics,
        }
    }
}

#[async_trait]
impl Stage for IndexingStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    async fn run(&self, job: &IngestionJob, input: &Path) -> Result<PathBuf, StageError> {
        let text = tokio::fs::read_to_string(input)
            .await
            .map_err(|source| StageError::Io {
                stage: STAGE_NAME,
                source,
            })?;

        let chunks = chunk_text(&text, &self.settings)?;
        let (prepared, skipped) = dedupe_chunks(chunks);
        if prepared.is_empty() {
            return Err(StageError::EmptyDocument);
        }

        let mut vectors = Vec::with_capacity(prepared.len());
        for batch in prepared.chunks(EMBED_BATCH_SIZE) {
            let texts = batch.iter().map(|chunk| chunk.text.clone()).collect();
            vectors.extend(self.embedder.generate_embeddings(texts).await?);
        }

        let timestamp = current_timestamp_rfc3339();
        let passages: Vec<PassageInsert> = prepared
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (chunk, vector))| {
                let mut metadata = Map::new();
                metadata.insert("source".into(), Value::String(job.raw_filename.clone()));
                metadata.insert("chunk_index".into(), Value::from(index));
                metadata.insert("chunk_hash".into(), Value::String(chunk.chunk_hash));
                metadata.insert("timestamp".into(), Value::String(timestamp.clone()));
                PassageInsert {
                    text: chunk.text,
                    vector,
                    metadata,
                }
            })
            .collect();

        let collection = &job.collection_name;
        if self.store.delete_collection(collection).await? {
            tracing::info!(collection = %collection, "Replacing existing collection");
        }
        self.store
            .ensure_collection(collection, self.embedder.dimension())
            .await?;
        let written = self.store.upsert(collection, passages).await?;
        self.metrics.record_chunks(written as u64);

        tracing::info!(
            job_id = %job.job_id,
            collection = %collection,
            chunk_size = self.settings.chunk_size,
            written,
            skipped_duplicates = skipped,
            "Indexed document"
        );
        Ok(input.to_path_buf())
    }
}
