// src/store.rs

use crate::models::{JobRecord, JobStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub type SharedStore = Arc<JobStore>;

struct Entry {
    seq: u64,
    job: JobRecord,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
}

/// In-memory map of job ID to job record.
///
/// Only the fetcher that owns a job calls [`JobStore::update`] for it; everyone
/// else reads snapshots through [`JobStore::get`]. Each update runs under the
/// write lock, so readers never see half of a progress update.
#[derive(Default)]
pub struct JobStore {
    inner: RwLock<Inner>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    pub fn insert(&self, job: JobRecord) {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.job_id, Entry { seq, job });
    }

    /// Snapshot of the job's current state.
    pub fn get(&self, job_id: &Uuid) -> Option<JobRecord> {
        self.inner.read().jobs.get(job_id).map(|e| e.job.clone())
    }

    /// Applies `f` to the job as one atomic step. Returns `None` if the job is unknown.
    pub fn update<R>(&self, job_id: &Uuid, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.jobs.get_mut(job_id).map(|e| f(&mut e.job))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.jobs.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|e| e.job.status == status)
            .count()
    }

    /// Drops the oldest finished jobs until at most `keep` terminal jobs remain.
    /// Jobs that are still queued or running are never evicted.
    pub fn evict_terminal(&self, keep: usize) -> Vec<Uuid> {
        let mut inner = self.inner.write();
        let mut terminal: Vec<(i64, u64, Uuid)> = inner
            .jobs
            .values()
            .filter(|e| e.job.is_terminal())
            .map(|e| (e.job.finished_at, e.seq, e.job.job_id))
            .collect();

        if terminal.len() <= keep {
            return Vec::new();
        }

        terminal.sort();
        let excess = terminal.len() - keep;
        let evicted: Vec<Uuid> = terminal.into_iter().take(excess).map(|(_, _, id)| id).collect();
        for id in &evicted {
            inner.jobs.remove(id);
        }
        evicted
    }
}
