//! Ingestion pipeline: conversion, enrichment, indexing.
//!
//! A job moves through [`PipelineStep`]s one [`PipelineOrchestrator::advance`] at a time. The
//! first step claims the job (`queued → processing`); each later step runs one pluggable
//! [`Stage`] on the previous stage's artifact. [`PipelineOrchestrator::run`] drives a job to the
//! end, removes the staging directory whatever the outcome, then records the terminal status.
//! There is no retry. A job whose tenant ended while it ran is failed and its collection is
//! discarded.

pub mod chunking;
pub mod indexing;
pub mod stages;
pub mod staging;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::embedding::EmbeddingClientError;
use crate::metrics::PipelineMetrics;
use crate::namespace::NamespaceManager;
use crate::status::{JobStatus, StatusStore};
use crate::store::StoreError;

pub use chunking::ChunkingError;
pub use indexing::IndexingStage;
pub use stages::{CommandStage, PassThroughStage};
pub use staging::StagingArea;
pub use worker::{JobQueue, QueueFull};

/// Failure of a single stage. Aborts the job.
#[derive(Debug, Error)]
pub enum StageError {
    /// Job was no longer `queued` when a worker picked it up.
    #[error("job for '{0}' was not in the queued state")]
    NotQueued(String),
    /// External command could not be started.
    #[error("{stage} command could not be started: {source}")]
    Spawn {
        /// Stage name.
        stage: &'static str,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },
    /// External command exited unsuccessfully.
    #[error("{stage} command exited with {status}: {stderr}")]
    CommandFailed {
        /// Stage name.
        stage: &'static str,
        /// Exit status as reported by the OS.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },
    /// Stage finished without producing its artifact.
    #[error("{stage} produced no output at {}", path.display())]
    MissingOutput {
        /// Stage name.
        stage: &'static str,
        /// Expected artifact path.
        path: PathBuf,
    },
    /// Reading or writing a staging artifact failed.
    #[error("{stage} artifact I/O failed: {source}")]
    Io {
        /// Stage name.
        stage: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Owning tenant's session ended before the job finished.
    #[error("tenant session ended before ingestion finished")]
    SessionEnded,
    /// Converted document held no indexable text.
    #[error("document produced no indexable text")]
    EmptyDocument,
    /// Chunking failed.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    /// Embedding collaborator failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Store write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Position of a job in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    /// Waiting to be claimed by a worker.
    Admit,
    /// Next step converts the staged upload to base markdown.
    Convert,
    /// Next step enriches the base markdown.
    Enrich,
    /// Next step indexes the enriched markdown.
    Index,
    /// Every stage succeeded.
    Finished,
}

/// One accepted upload travelling through the pipeline.
#[derive(Debug)]
pub struct IngestionJob {
    /// Identifier used in log lines.
    pub job_id: Uuid,
    /// Filename as uploaded.
    pub raw_filename: String,
    /// Sanitized short name shown to the client.
    pub short_name: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Tenant-scoped collection name; also the status key.
    pub collection_name: String,
    staging: StagingArea,
    artifact: PathBuf,
    step: PipelineStep,
    tenant_epoch: u64,
}

impl IngestionJob {
    /// Build a job around an already-populated staging area.
    pub fn new(
        raw_filename: impl Into<String>,
        short_name: impl Into<String>,
        tenant_id: impl Into<String>,
        collection_name: impl Into<String>,
        staging: StagingArea,
    ) -> Self {
        let artifact = staging.input().to_path_buf();
        Self {
            job_id: Uuid::new_v4(),
            raw_filename: raw_filename.into(),
            short_name: short_name.into(),
            tenant_id: tenant_id.into(),
            collection_name: collection_name.into(),
            staging,
            artifact,
            step: PipelineStep::Admit,
            tenant_epoch: 0,
        }
    }

    /// Record the tenant epoch the job was submitted under.
    pub fn with_tenant_epoch(mut self, epoch: u64) -> Self {
        self.tenant_epoch = epoch;
        self
    }

    /// Directory stages write their outputs into.
    pub fn staging_dir(&self) -> &Path {
        self.staging.dir()
    }

    /// Artifact produced by the most recent stage (the upload before any stage ran).
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Current step.
    pub fn step(&self) -> PipelineStep {
        self.step
    }

    /// Tenant epoch recorded at submission.
    pub fn tenant_epoch(&self) -> u64 {
        self.tenant_epoch
    }
}

/// A pipeline capability: consumes one artifact and produces the next.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Process `input`, writing any output under the job's staging directory.
    async fn run(&self, job: &IngestionJob, input: &Path) -> Result<PathBuf, StageError>;
}

/// The three stages in execution order.
#[derive(Clone)]
pub struct PipelineStages {
    /// Upload to base markdown.
    pub conversion: Arc<dyn Stage>,
    /// Base markdown to enriched markdown.
    pub enrichment: Arc<dyn Stage>,
    /// Enriched markdown into the tenant collection.
    pub indexing: Arc<dyn Stage>,
}

/// Drives jobs through the stage sequence and owns their terminal bookkeeping.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    status: Arc<dyn StatusStore>,
    namespace: NamespaceManager,
    stages: PipelineStages,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator over shared status and metrics.
    pub fn new(
        status: Arc<dyn StatusStore>,
        namespace: NamespaceManager,
        stages: PipelineStages,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            status,
            namespace,
            stages,
            metrics,
        }
    }

    /// Perform the job's next transition.
    pub async fn advance(&self, job: &mut IngestionJob) -> Result<(), StageError> {
        let (stage, next) = match job.step {
            PipelineStep::Admit => {
                if !self.status.compare_and_swap(
                    &job.collection_name,
                    JobStatus::Queued,
                    JobStatus::Processing,
                ) {
                    return Err(StageError::NotQueued(job.collection_name.clone()));
                }
                job.step = PipelineStep::Convert;
                return Ok(());
            }
            PipelineStep::Convert => (&self.stages.conversion, PipelineStep::Enrich),
            PipelineStep::Enrich => (&self.stages.enrichment, PipelineStep::Index),
            PipelineStep::Index => (&self.stages.indexing, PipelineStep::Finished),
            PipelineStep::Finished => return Ok(()),
        };

        tracing::debug!(
            job_id = %job.job_id,
            collection = %job.collection_name,
            stage = stage.name(),
            "Running stage"
        );
        let input = job.artifact.clone();
        job.artifact = stage.run(job, &input).await?;
        job.step = next;
        Ok(())
    }

    /// Run a job to a terminal state and clean up its staging directory.
    pub async fn run(&self, mut job: IngestionJob) -> JobStatus {
        let outcome = loop {
            if job.step != PipelineStep::Admit && !self.tenant_is_current(&job) {
                break Err(StageError::SessionEnded);
            }
            if job.step == PipelineStep::Finished {
                break Ok(());
            }
            if let Err(error) = self.advance(&mut job).await {
                break Err(error);
            }
        };

        let tenant_ended = !self.tenant_is_current(&job);
        let outcome = match outcome {
            Ok(()) if tenant_ended => Err(StageError::SessionEnded),
            other => other,
        };
        let IngestionJob {
            job_id,
            tenant_id,
            collection_name: key,
            staging,
            step,
            ..
        } = job;
        if let Err(error) = staging.remove().await {
            tracing::warn!(collection = %key, error = %error, "Failed to remove staging directory");
        }
        if tenant_ended && !matches!(outcome, Err(StageError::NotQueued(_))) {
            self.namespace.discard_collection(&key).await;
        }

        match outcome {
            Ok(()) => {
                self.finish(&key, JobStatus::Completed);
                tracing::info!(job_id = %job_id, collection = %key, "Ingestion completed");
                JobStatus::Completed
            }
            Err(StageError::NotQueued(_)) => {
                tracing::warn!(job_id = %job_id, collection = %key, "Job no longer queued; skipped");
                self.status.get(&key)
            }
            Err(error) => {
                self.finish(&key, JobStatus::Failed);
                tracing::error!(
                    job_id = %job_id,
                    collection = %key,
                    tenant = %tenant_id,
                    step = ?step,
                    error = %error,
                    "Ingestion failed"
                );
                JobStatus::Failed
            }
        }
    }

    fn tenant_is_current(&self, job: &IngestionJob) -> bool {
        self.namespace.is_current(&job.tenant_id, job.tenant_epoch)
    }

    fn finish(&self, key: &str, terminal: JobStatus) {
        if self
            .status
            .compare_and_swap(key, JobStatus::Processing, terminal)
        {
            match terminal {
                JobStatus::Completed => self.metrics.record_completed(),
                _ => self.metrics.record_failed(),
            }
        } else {
            tracing::warn!(collection = %key, status = ?terminal, "Status moved underneath the job");
        }
    }
}
