//! Bounded job queue feeding a fixed pool of pipeline workers.
//!
//! Admission is decided at submit time: when every slot in the queue is taken the upload is
//! refused instead of spawning more work. Workers pull jobs one at a time and run each to a
//! terminal state before taking the next.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{IngestionJob, PipelineOrchestrator};

/// Queue was full or closed; the job is handed back to the caller.
#[derive(Debug, Error)]
#[error("pipeline queue is full")]
pub struct QueueFull(pub Box<IngestionJob>);

/// Sending half of the pipeline queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<IngestionJob>,
}

impl JobQueue {
    /// Create a queue holding at most `capacity` waiting jobs.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IngestionJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue without waiting.
    pub fn try_submit(&self, job: IngestionJob) -> Result<(), QueueFull> {
        self.sender.try_send(job).map_err(|error| {
            let job = match error {
                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
            };
            QueueFull(Box::new(job))
        })
    }

    /// Jobs that can still be accepted right now.
    pub fn remaining_capacity(&self) -> usize {
        self.sender.capacity()
    }
}

/// Start `workers` tasks consuming `receiver`. They exit once every [`JobQueue`] is dropped.
pub fn spawn_workers(
    workers: usize,
    receiver: mpsc::Receiver<IngestionJob>,
    orchestrator: PipelineOrchestrator,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..workers.max(1))
        .map(|worker_id| {
            let receiver = receiver.clone();
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                tracing::debug!(worker_id, "Pipeline worker started");
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };
                    tracing::info!(
                        worker_id,
                        job_id = %job.job_id,
                        collection = %job.collection_name,
                        "Processing job"
                    );
                    orchestrator.run(job).await;
                }
                tracing::debug!(worker_id, "Pipeline worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;
    use crate::namespace::NamespaceManager;
    use crate::pipeline::{PassThroughStage, PipelineStages, StagingArea};
    use crate::status::{InMemoryStatusStore, JobStatus, StatusStore};
    use crate::store::InMemoryStore;

    async fn job(root: &std::path::Path, key: &str) -> IngestionJob {
        let staging = StagingArea::create(root, key, "doc.txt", b"text")
            .await
            .expect("stage");
        IngestionJob::new("doc.txt", "doc", "alice", key, staging)
    }

    #[tokio::test]
    async fn full_queue_hands_job_back() {
        let root = tempfile::tempdir().expect("tempdir");
        let (queue, _receiver) = JobQueue::new(1);
        queue.try_submit(job(root.path(), "a").await).expect("first fits");

        let rejected = queue.try_submit(job(root.path(), "b").await).unwrap_err();
        assert_eq!(rejected.0.collection_name, "b");
        assert_eq!(queue.remaining_capacity(), 0);
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let root = tempfile::tempdir().expect("tempdir");
        let status = Arc::new(InMemoryStatusStore::new());
        let copy = |name| -> Arc<dyn crate::pipeline::Stage> {
            Arc::new(PassThroughStage::new(name, format!("{name}.out")))
        };
        let orchestrator = PipelineOrchestrator::new(
            status.clone(),
            NamespaceManager::new(Arc::new(InMemoryStore::new())),
            PipelineStages {
                conversion: copy("conversion"),
                enrichment: copy("enrichment"),
                indexing: copy("indexing"),
            },
            Arc::new(PipelineMetrics::new()),
        );
        let (queue, receiver) = JobQueue::new(4);
        let handles = spawn_workers(2, receiver, orchestrator);

        for key in ["one", "two", "three"] {
            assert!(status.register(key));
            queue.try_submit(job(root.path(), key).await).expect("submit");
        }
        drop(queue);
        for handle in handles {
            handle.await.expect("worker");
        }

        for key in ["one", "two", "three"] {
            assert_eq!(status.get(key), JobStatus::Completed);
        }
    }
}
