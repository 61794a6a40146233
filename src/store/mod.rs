//! Storage abstraction over the vector engine.
//!
//! Every collection (the global knowledge base and each tenant document) lives in one store
//! engine. The [`VectorStore`] trait is the seam the pipeline, namespace manager, and retriever
//! share; [`QdrantService`](crate::qdrant::QdrantService) is the production backend and
//! [`memory::InMemoryStore`] backs tests and offline runs.
//!
//! Implementations must tolerate concurrent writers to distinct collections.

pub mod memory;
mod qdrant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use memory::InMemoryStore;

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Qdrant transport or protocol failure.
    #[error(transparent)]
    Qdrant(#[from] crate::qdrant::QdrantError),
    /// Backend could not be reached.
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),
}

/// Passage ready to be written into a collection.
#[derive(Debug, Clone)]
pub struct PassageInsert {
    /// Chunk text.
    pub text: String,
    /// Embedding vector for the text.
    pub vector: Vec<f32>,
    /// Provenance metadata stored next to the text.
    pub metadata: Map<String, Value>,
}

/// Passage returned from a similarity search, tagged with the collection it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    /// Collection that produced the passage.
    pub collection: String,
    /// Passage text.
    pub text: String,
    /// Similarity score reported by the engine.
    pub score: f32,
    /// Stored provenance metadata.
    pub metadata: Map<String, Value>,
}

/// Operations the core needs from the vector engine.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Enumerate every collection name in the store.
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Check whether a collection exists.
    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Create a collection if it is missing.
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), StoreError>;

    /// Delete a collection, returning whether it existed.
    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError>;

    /// Number of passages stored in a collection.
    async fn count(&self, name: &str) -> Result<usize, StoreError>;

    /// Append passages to a collection, returning how many were written.
    async fn upsert(&self, name: &str, passages: Vec<PassageInsert>) -> Result<usize, StoreError>;

    /// Return the `limit` nearest passages to `vector`, best first.
    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<Passage>, StoreError>;
}
