use super::{Passage, PassageInsert, StoreError, VectorStore};
use crate::qdrant::{PointInsert, QdrantService, payload::split_payload};
use async_trait::async_trait;

#[async_trait]
impl VectorStore for QdrantService {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(QdrantService::list_collections(self).await?)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(QdrantService::collection_exists(self, name).await?)
    }

    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), StoreError> {
        Ok(self
            .create_collection_if_not_exists(name, vector_size as u64)
            .await?)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError> {
        Ok(QdrantService::delete_collection(self, name).await?)
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        Ok(self.count_points(name).await?)
    }

    async fn upsert(&self, name: &str, passages: Vec<PassageInsert>) -> Result<usize, StoreError> {
        let points = passages
            .into_iter()
            .map(|passage| PointInsert {
                text: passage.text,
                vector: passage.vector,
                metadata: passage.metadata,
            })
            .collect();
        Ok(self.index_points(name, points).await?)
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<Passage>, StoreError> {
        let hits = self.search_points(name, vector, limit).await?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                let (text, metadata) = split_payload(hit.payload);
                Passage {
                    collection: name.to_string(),
                    text,
                    score: hit.score,
                    metadata,
                }
            })
            .collect())
    }
}
