//! Upload admission and job scheduling.
//!
//! [`JobDispatcher::submit`] validates an upload before touching the filesystem, derives the
//! short and collection names, stages the bytes, registers the job as `queued`, and hands it to
//! the worker pool. It returns as soon as the job is queued.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::metrics::PipelineMetrics;
use crate::namespace::{NamespaceManager, derive_name, sanitize_short_name};
use crate::pipeline::{IngestionJob, JobQueue, StagingArea};
use crate::status::{JobStatus, StatusStore};

/// Reasons an upload is refused. No job exists after any of these.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// File extension is not on the allow list.
    #[error("Unsupported file type '{0}'")]
    UnsupportedType(String),
    /// File exceeds the size ceiling.
    #[error("File is {size} bytes; the limit is {limit} bytes")]
    TooLarge {
        /// Received size.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// File has no content.
    #[error("File is empty")]
    EmptyFile,
    /// A job for the same document is still queued or processing.
    #[error("'{0}' is already being processed")]
    JobInFlight(String),
    /// Every queue slot is taken.
    #[error("Ingestion queue is full; try again shortly")]
    QueueFull,
    /// Writing the staging area failed.
    #[error("Failed to stage upload: {0}")]
    Staging(#[from] io::Error),
}

/// Limits applied to uploads.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Upload size ceiling in bytes.
    pub max_bytes: usize,
    /// Accepted extensions, lowercase and without the dot.
    pub allowed_extensions: Vec<String>,
    /// Root of the per-job staging directories.
    pub staging_root: PathBuf,
}

impl UploadPolicy {
    /// Policy taken from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.max_upload_bytes,
            allowed_extensions: config.allowed_extensions.clone(),
            staging_root: config.staging_root.clone(),
        }
    }

    /// Check type and size. Performs no I/O.
    pub fn validate(&self, filename: &str, size: usize) -> Result<(), SubmitError> {
        self.check_type(filename)?;
        self.check_size(size)
    }

    /// Reject filenames whose extension is not allowed.
    pub fn check_type(&self, filename: &str) -> Result<(), SubmitError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if self.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            Ok(())
        } else {
            Err(SubmitError::UnsupportedType(extension))
        }
    }

    /// Reject empty or oversized payloads.
    pub fn check_size(&self, size: usize) -> Result<(), SubmitError> {
        if size > self.max_bytes {
            return Err(SubmitError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        if size == 0 {
            return Err(SubmitError::EmptyFile);
        }
        Ok(())
    }
}

/// Handle returned to the uploader.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    /// Filename as uploaded.
    pub filename: String,
    /// Sanitized short name the client uses for status and chat.
    pub short_name: String,
    /// Tenant-scoped collection name; never sent to clients.
    #[serde(skip)]
    pub collection_name: String,
    /// Status right after submission.
    pub status: JobStatus,
}

/// Validates uploads and schedules pipeline jobs.
#[derive(Clone)]
pub struct JobDispatcher {
    policy: UploadPolicy,
    status: Arc<dyn StatusStore>,
    namespace: NamespaceManager,
    queue: JobQueue,
    metrics: Arc<PipelineMetrics>,
}

impl JobDispatcher {
    /// Create a dispatcher feeding `queue`.
    pub fn new(
        policy: UploadPolicy,
        status: Arc<dyn StatusStore>,
        namespace: NamespaceManager,
        queue: JobQueue,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            policy,
            status,
            namespace,
            queue,
            metrics,
        }
    }

    /// Upload limits in force.
    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Accept an upload for `tenant_id` and queue it for processing.
    pub async fn submit(
        &self,
        filename: &str,
        bytes: &[u8],
        tenant_id: &str,
    ) -> Result<JobHandle, SubmitError> {
        self.policy.validate(filename, bytes.len())?;

        let stem = Path::new(filename)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let short_name = sanitize_short_name(stem);
        let collection_name = derive_name(tenant_id, &short_name);

        if !self.status.register(&collection_name) {
            return Err(SubmitError::JobInFlight(short_name));
        }

        let staging =
            match StagingArea::create(&self.policy.staging_root, &collection_name, filename, bytes)
                .await
            {
                Ok(staging) => staging,
                Err(error) => {
                    self.status.withdraw(&collection_name);
                    return Err(SubmitError::Staging(error));
                }
            };

        let job = IngestionJob::new(filename, &short_name, tenant_id, &collection_name, staging)
            .with_tenant_epoch(self.namespace.tenant_epoch(tenant_id));
        let job_id = job.job_id;
        if let Err(rejected) = self.queue.try_submit(job) {
            self.status.withdraw(&collection_name);
            drop(rejected);
            tracing::warn!(collection = %collection_name, "Upload refused; pipeline queue full");
            return Err(SubmitError::QueueFull);
        }

        self.metrics.record_submitted();
        tracing::info!(
            %job_id,
            collection = %collection_name,
            size = bytes.len(),
            "Upload queued"
        );
        Ok(JobHandle {
            filename: filename.to_string(),
            short_name,
            collection_name,
            status: JobStatus::Queued,
        })
    }

    /// Status of the caller's document `short_name`.
    pub fn get_status(&self, tenant_id: &str, short_name: &str) -> JobStatus {
        self.status
            .get(&derive_name(tenant_id, &sanitize_short_name(short_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::InMemoryStatusStore;

    struct Fixture {
        dispatcher: JobDispatcher,
        status: Arc<InMemoryStatusStore>,
        namespace: NamespaceManager,
        root: tempfile::TempDir,
        receiver: tokio::sync::mpsc::Receiver<IngestionJob>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let status = Arc::new(InMemoryStatusStore::new());
        let (queue, receiver) = JobQueue::new(capacity);
        let namespace = NamespaceManager::new(Arc::new(crate::store::InMemoryStore::new()));
        let policy = UploadPolicy {
            max_bytes: 1024 * 1024,
            allowed_extensions: vec!["pdf".into()],
            staging_root: root.path().join("staging"),
        };
        Fixture {
            dispatcher: JobDispatcher::new(
                policy,
                status.clone(),
                namespace.clone(),
                queue,
                Arc::new(PipelineMetrics::new()),
            ),
            status,
            namespace,
            root,
            receiver,
        }
    }

    #[tokio::test]
    async fn accepted_upload_is_queued_and_staged() {
        let f = fixture(4);
        let handle = f
            .dispatcher
            .submit("Syllabus.pdf", &vec![b'x'; 900 * 1024], "alice")
            .await
            .expect("accepted");

        assert_eq!(handle.short_name, "Syllabus");
        assert_eq!(handle.collection_name, derive_name("alice", "Syllabus"));
        assert_eq!(handle.status, JobStatus::Queued);
        assert_eq!(f.dispatcher.get_status("alice", "Syllabus"), JobStatus::Queued);
        assert_eq!(f.dispatcher.get_status("bob", "Syllabus"), JobStatus::Unknown);
        assert!(
            f.root
                .path()
                .join("staging")
                .join(&handle.collection_name)
                .join("input.pdf")
                .exists()
        );
    }

    #[tokio::test]
    async fn wrong_type_is_rejected_without_status_or_staging() {
        let f = fixture(4);
        let error = f
            .dispatcher
            .submit("notes.docx", b"PK", "alice")
            .await
            .unwrap_err();

        assert!(matches!(error, SubmitError::UnsupportedType(ext) if ext == "docx"));
        assert_eq!(f.status.get(&derive_name("alice", "notes")), JobStatus::Unknown);
        assert!(!f.root.path().join("staging").exists());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_before_staging() {
        let f = fixture(4);
        let error = f
            .dispatcher
            .submit("big.pdf", &vec![0u8; 1024 * 1024 + 1], "alice")
            .await
            .unwrap_err();

        assert!(matches!(error, SubmitError::TooLarge { .. }));
        assert!(!f.root.path().join("staging").exists());
        assert_eq!(f.dispatcher.get_status("alice", "big"), JobStatus::Unknown);
    }

    #[tokio::test]
    async fn duplicate_in_flight_upload_conflicts() {
        let f = fixture(4);
        f.dispatcher
            .submit("Syllabus.pdf", b"%PDF", "alice")
            .await
            .expect("first");
        assert!(matches!(
            f.dispatcher.submit("Syllabus.pdf", b"%PDF", "alice").await,
            Err(SubmitError::JobInFlight(_))
        ));
        f.dispatcher
            .submit("Syllabus.pdf", b"%PDF", "bob")
            .await
            .expect("other tenant is independent");
    }

    #[tokio::test]
    async fn full_queue_refuses_and_leaves_no_trace() {
        let f = fixture(1);
        f.dispatcher
            .submit("one.pdf", b"%PDF", "alice")
            .await
            .expect("first");
        let error = f
            .dispatcher
            .submit("two.pdf", b"%PDF", "alice")
            .await
            .unwrap_err();

        assert!(matches!(error, SubmitError::QueueFull));
        assert_eq!(f.dispatcher.get_status("alice", "two"), JobStatus::Unknown);
        assert!(
            !f.root
                .path()
                .join("staging")
                .join(derive_name("alice", "two"))
                .exists()
        );
    }

    #[tokio::test]
    async fn queued_job_carries_the_current_tenant_epoch() {
        let mut f = fixture(4);
        f.namespace.end_tenant("alice").await;
        f.dispatcher
            .submit("Syllabus.pdf", b"%PDF", "alice")
            .await
            .expect("accepted");

        let job = f.receiver.recv().await.expect("queued job");
        assert!(f.namespace.is_current("alice", job.tenant_epoch()));
        f.namespace.end_tenant("alice").await;
        assert!(!f.namespace.is_current("alice", job.tenant_epoch()));
    }
}
