#![deny(missing_docs)]

//! Core library for the ragdesk document ingestion and conversational retrieval server.

/// HTTP routing and REST handlers.
pub mod api;
/// History-aware conversational retrieval.
pub mod chat;
/// Environment-driven configuration management.
pub mod config;
/// Upload validation and job scheduling.
pub mod dispatcher;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Idempotent ingestion of the shared knowledge corpus.
pub mod knowledge;
/// Chat model client abstraction and adapters.
pub mod llm;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion pipeline counters.
pub mod metrics;
/// Tenant-scoped collection naming and cleanup.
pub mod namespace;
/// Staged ingestion pipeline and its worker pool.
pub mod pipeline;
/// Qdrant vector store integration.
pub mod qdrant;
/// Retrieval across the global and tenant collections.
pub mod retrieval;
/// Session identities and session-end cleanup.
pub mod session;
/// Job status tracking.
pub mod status;
/// Vector store abstraction and implementations.
pub mod store;
