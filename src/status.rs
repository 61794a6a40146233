//! Process-wide job status tracking.
//!
//! Statuses are keyed by the tenant-scoped collection name so identically named uploads from
//! two tenants never share an entry. The [`StatusStore`] trait is the seam for an external
//! cache when the service runs as more than one process.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// A worker is running the stages.
    Processing,
    /// Every stage succeeded.
    Completed,
    /// A stage failed; the job will not be retried.
    Failed,
    /// No job with this key was submitted during this process lifetime.
    Unknown,
}

impl JobStatus {
    /// Whether the status is final.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

/// Concurrent status mapping shared by the dispatcher, workers, and the API.
pub trait StatusStore: Send + Sync {
    /// Current status, or [`JobStatus::Unknown`] for keys never registered.
    fn get(&self, key: &str) -> JobStatus;

    /// Overwrite the status unconditionally.
    fn set(&self, key: &str, status: JobStatus);

    /// Replace `expected` with `next` atomically. Returns `false` when the stored value differs.
    fn compare_and_swap(&self, key: &str, expected: JobStatus, next: JobStatus) -> bool;

    /// Record a new job as queued.
    ///
    /// Fails when a job for the same key is still queued or processing. A key whose previous
    /// job reached a terminal state may be registered again.
    fn register(&self, key: &str) -> bool;

    /// Remove a queued entry that never reached a worker.
    fn withdraw(&self, key: &str);

    /// Drop every terminal entry whose key starts with `prefix`, returning how many went.
    fn clear_finished(&self, prefix: &str) -> usize;
}

/// In-memory [`StatusStore`] backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryStatusStore {
    entries: DashMap<String, JobStatus>,
}

impl InMemoryStatusStore {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn get(&self, key: &str) -> JobStatus {
        self.entries
            .get(key)
            .map(|entry| *entry.value())
            .unwrap_or(JobStatus::Unknown)
    }

    fn set(&self, key: &str, status: JobStatus) {
        self.entries.insert(key.to_string(), status);
    }

    fn compare_and_swap(&self, key: &str, expected: JobStatus, next: JobStatus) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if *entry.value() == expected => {
                *entry.value_mut() = next;
                true
            }
            _ => false,
        }
    }

    fn register(&self, key: &str) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_terminal() {
                    occupied.insert(JobStatus::Queued);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(JobStatus::Queued);
                true
            }
        }
    }

    fn withdraw(&self, key: &str) {
        self.entries
            .remove_if(key, |_, status| *status == JobStatus::Queued);
    }

    fn clear_finished(&self, prefix: &str) -> usize {
        let mut cleared = 0;
        self.entries.retain(|key, status| {
            let finished = key.starts_with(prefix) && status.is_terminal();
            cleared += usize::from(finished);
            !finished
        });
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unknown_for_unregistered_keys() {
        let store = InMemoryStatusStore::new();
        assert_eq!(store.get("u_alice_Syllabus"), JobStatus::Unknown);
    }

    #[test]
    fn register_rejects_in_flight_and_allows_after_terminal() {
        let store = InMemoryStatusStore::new();
        assert!(store.register("job"));
        assert!(!store.register("job"));

        assert!(store.compare_and_swap("job", JobStatus::Queued, JobStatus::Processing));
        assert!(!store.register("job"));

        assert!(store.compare_and_swap("job", JobStatus::Processing, JobStatus::Failed));
        assert!(store.register("job"));
        assert_eq!(store.get("job"), JobStatus::Queued);
    }

    #[test]
    fn compare_and_swap_rejects_stale_expectation() {
        let store = InMemoryStatusStore::new();
        store.set("job", JobStatus::Completed);
        assert!(!store.compare_and_swap("job", JobStatus::Processing, JobStatus::Failed));
        assert_eq!(store.get("job"), JobStatus::Completed);
    }

    #[test]
    fn withdraw_only_removes_queued_entries() {
        let store = InMemoryStatusStore::new();
        store.set("running", JobStatus::Processing);
        store.withdraw("running");
        assert_eq!(store.get("running"), JobStatus::Processing);

        assert!(store.register("waiting"));
        store.withdraw("waiting");
        assert_eq!(store.get("waiting"), JobStatus::Unknown);
    }

    #[test]
    fn clear_finished_keeps_in_flight_and_foreign_keys() {
        let store = InMemoryStatusStore::new();
        store.set("u_alice_a", JobStatus::Completed);
        store.set("u_alice_b", JobStatus::Failed);
        store.set("u_alice_c", JobStatus::Queued);
        store.set("u_bob_a", JobStatus::Completed);

        assert_eq!(store.clear_finished("u_alice_"), 2);
        assert_eq!(store.get("u_alice_a"), JobStatus::Unknown);
        assert_eq!(store.get("u_alice_c"), JobStatus::Queued);
        assert_eq!(store.get("u_bob_a"), JobStatus::Completed);
    }

    #[test]
    fn transitions_are_forward_only() {
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_advance_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_advance_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_advance_to(JobStatus::Completed));
        assert!(!JobStatus::Queued.can_advance_to(JobStatus::Completed));
    }

    #[test]
    fn concurrent_swaps_have_one_winner() {
        let store = Arc::new(InMemoryStatusStore::new());
        store.set("job", JobStatus::Processing);
        let handles: Vec<_> = [JobStatus::Completed, JobStatus::Failed]
            .into_iter()
            .cycle()
            .take(8)
            .map(|next| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.compare_and_swap("job", JobStatus::Processing, next)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(store.get("job").is_terminal());
    }
}
