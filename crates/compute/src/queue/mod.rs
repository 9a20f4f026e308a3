//! Durable FIFO of submissions made while disconnected.
//!
//! Entries are written to a JSON file before `enqueue` returns. `drain`
//! hands them to a [`DrainTarget`] strictly from the head; an entry leaves
//! the queue only once the target reports a job for it. A deferral (provider
//! unreachable, credentials rejected) stops the drain with the current entry
//! still at the head.

mod connectivity;

pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpProbe};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::{new_idempotency_key, JobConfig, JobId};

/// A submission waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    /// Local pending ID returned by `enqueue`.
    pub local_id: String,
    /// Position in creation order.
    pub seq: u64,
    /// Target provider.
    pub provider: String,
    /// Job to submit.
    pub config: JobConfig,
    /// Key carried through to the provider.
    pub idempotency_key: String,
    /// When the entry was queued.
    pub created_at: DateTime<Utc>,
    /// Drains that deferred this entry.
    pub attempts: u32,
    /// Reason of the last deferral.
    pub last_error: Option<String>,
}

/// What happened to one entry during a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainDisposition {
    /// A job exists for the entry (new, adopted or previously created).
    Submitted(JobId),
    /// The entry can never be submitted; a failed job records why.
    Rejected(JobId),
    /// Try again later; the entry stays at the head.
    Deferred(String),
}

/// Receiver of drained entries.
#[async_trait]
pub trait DrainTarget: Send + Sync {
    /// Submit one queued entry, checking first whether it already landed.
    async fn submit_queued(&self, entry: &QueuedSubmission) -> Result<DrainDisposition>;
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// `(local_id, job_id)` of entries that became jobs, in queue order.
    pub submitted: Vec<(String, JobId)>,
    /// `(local_id, job_id)` of entries recorded as failed jobs.
    pub rejected: Vec<(String, JobId)>,
    /// Entries still queued.
    pub remaining: usize,
    /// Why the drain stopped early.
    pub deferred: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    next_seq: u64,
    entries: Vec<QueuedSubmission>,
}

/// File-backed offline queue.
#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
    drain_lock: Mutex<()>,
}

impl OfflineQueue {
    /// Open the queue stored at `path`, creating it on first write.
    ///
    /// # Errors
    /// Returns an I/O or serialization error if an existing file cannot be
    /// read.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut state: QueueState = serde_json::from_slice(&bytes)?;
                state.entries.sort_by_key(|e| e.seq);
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueState::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = state.entries.len(), "Opened offline queue");

        Ok(Self {
            path,
            state: Mutex::new(state),
            drain_lock: Mutex::new(()),
        })
    }

    /// Queue a submission with a fresh idempotency key.
    ///
    /// # Errors
    /// Returns `Validation` for invalid configs or an I/O error if the
    /// entry could not be persisted.
    pub async fn enqueue(&self, provider: &str, config: JobConfig) -> Result<QueuedSubmission> {
        self.enqueue_with_key(provider, config, new_idempotency_key())
            .await
    }

    /// Queue a submission under a caller-chosen idempotency key.
    ///
    /// # Errors
    /// Returns `Validation` for invalid configs or an I/O error if the
    /// entry could not be persisted.
    pub async fn enqueue_with_key(
        &self,
        provider: &str,
        config: JobConfig,
        idempotency_key: String,
    ) -> Result<QueuedSubmission> {
        config.validate()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .entries
            .iter()
            .find(|e| e.idempotency_key == idempotency_key)
        {
            return Ok(existing.clone());
        }

        let seq = state.next_seq;
        let entry = QueuedSubmission {
            local_id: format!(
                "queued-{seq}-{}",
                idempotency_key.chars().take(8).collect::<String>()
            ),
            seq,
            provider: provider.to_string(),
            config,
            idempotency_key,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        self.commit(&mut state, |next| {
            next.next_seq += 1;
            next.entries.push(entry.clone());
        })
        .await?;

        info!(local_id = %entry.local_id, provider = %provider, "Queued submission while offline");
        Ok(entry)
    }

    /// Entries in FIFO order.
    pub async fn pending(&self) -> Vec<QueuedSubmission> {
        self.state.lock().await.entries.clone()
    }

    /// Number of queued entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Submit queued entries in order until the queue is empty or the
    /// target defers.
    ///
    /// # Errors
    /// Returns `DrainInProgress` if another drain is running, or the
    /// target's or the file's error. Entries handled before an error are
    /// already removed.
    pub async fn drain(&self, target: &dyn DrainTarget) -> Result<DrainReport> {
        let Ok(_drain) = self.drain_lock.try_lock() else {
            return Err(OrchestratorError::DrainInProgress);
        };
        let mut report = DrainReport::default();

        loop {
            let head = self.state.lock().await.entries.first().cloned();
            let Some(entry) = head else {
                break;
            };

            match target.submit_queued(&entry).await {
                Ok(DrainDisposition::Submitted(job_id)) => {
                    info!(local_id = %entry.local_id, job_id = %job_id, "Drained queued submission");
                    self.remove(&entry.local_id).await?;
                    report.submitted.push((entry.local_id, job_id));
                }
                Ok(DrainDisposition::Rejected(job_id)) => {
                    warn!(local_id = %entry.local_id, job_id = %job_id, "Queued submission rejected");
                    self.remove(&entry.local_id).await?;
                    report.rejected.push((entry.local_id, job_id));
                }
                Ok(DrainDisposition::Deferred(reason)) => {
                    warn!(local_id = %entry.local_id, reason = %reason, "Drain deferred");
                    self.note_deferral(&entry.local_id, &reason).await?;
                    report.deferred = Some(reason);
                    break;
                }
                Err(e) => {
                    self.note_deferral(&entry.local_id, &e.to_string()).await?;
                    return Err(e);
                }
            }
        }

        report.remaining = self.len().await;
        Ok(report)
    }

    async fn remove(&self, local_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.commit(&mut state, |next| next.entries.retain(|e| e.local_id != local_id))
            .await
    }

    async fn note_deferral(&self, local_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.commit(&mut state, |next| {
            if let Some(entry) = next.entries.iter_mut().find(|e| e.local_id == local_id) {
                entry.attempts += 1;
                entry.last_error = Some(reason.to_string());
            }
        })
        .await
    }

    /// Write `change` applied to a copy of `state`; memory follows only
    /// once the file does.
    async fn commit(
        &self,
        state: &mut QueueState,
        change: impl FnOnce(&mut QueueState),
    ) -> Result<()> {
        let mut next = state.clone();
        change(&mut next);
        persist(&self.path, &next).await?;
        *state = next;
        Ok(())
    }
}

async fn persist(path: &Path, state: &QueueState) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn config(name: &str) -> JobConfig {
        JobConfig::new(name, "gpu_1x_a100", "llama-3-8b", "s3://data/train.jsonl")
    }

    /// Accepts everything, optionally deferring the n-th call.
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
        defer_at: Option<usize>,
    }

    #[async_trait]
    impl DrainTarget for Recorder {
        async fn submit_queued(&self, entry: &QueuedSubmission) -> Result<DrainDisposition> {
            let mut seen = self.seen.lock().unwrap();
            if self.defer_at == Some(seen.len()) {
                return Ok(DrainDisposition::Deferred("offline".into()));
            }
            seen.push(entry.config.name.clone());
            Ok(DrainDisposition::Submitted(JobId::new(format!("job-{}", entry.seq))))
        }
    }

    #[tokio::test]
    async fn test_enqueue_survives_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let queue = OfflineQueue::open(&path).await.unwrap();
        for name in ["a", "b", "c"] {
            queue.enqueue("mock", config(name)).await.unwrap();
        }
        drop(queue);

        let reopened = OfflineQueue::open(&path).await.unwrap();
        let names: Vec<_> = reopened
            .pending()
            .await
            .into_iter()
            .map(|e| e.config.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let next = reopened.enqueue("mock", config("d")).await.unwrap();
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn test_enqueue_same_key_is_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("q.json")).await.unwrap();

        let first = queue
            .enqueue_with_key("mock", config("a"), "key-1".into())
            .await
            .unwrap();
        let second = queue
            .enqueue_with_key("mock", config("a"), "key-1".into())
            .await
            .unwrap();
        assert_eq!(first.local_id, second.local_id);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("q.json")).await.unwrap();
        let err = queue.enqueue("mock", config("")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("q.json")).await.unwrap();
        for name in ["a", "b", "c"] {
            queue.enqueue("mock", config(name)).await.unwrap();
        }

        let target = Recorder::default();
        let report = queue.drain(&target).await.unwrap();

        assert_eq!(*target.seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(report.submitted.len(), 3);
        assert_eq!(report.remaining, 0);
        assert!(report.deferred.is_none());
    }

    #[tokio::test]
    async fn test_deferral_keeps_head_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("q.json")).await.unwrap();
        for name in ["a", "b", "c"] {
            queue.enqueue("mock", config(name)).await.unwrap();
        }

        let target = Recorder {
            defer_at: Some(1),
            ..Recorder::default()
        };
        let report = queue.drain(&target).await.unwrap();

        assert_eq!(report.submitted.len(), 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.deferred.as_deref(), Some("offline"));

        let pending = queue.pending().await;
        assert_eq!(pending[0].config.name, "b");
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("offline"));
        assert_eq!(pending[1].config.name, "c");
    }

    /// Occupy the temp-file path with a directory so every write fails.
    fn block_writes(path: &Path) -> PathBuf {
        let blocker = path.with_extension("json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        blocker
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_nothing_queued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        let queue = OfflineQueue::open(&path).await.unwrap();
        queue.enqueue("mock", config("kept")).await.unwrap();

        let blocker = block_writes(&path);
        assert!(queue.enqueue("mock", config("lost")).await.is_err());
        assert_eq!(queue.len().await, 1);

        let target = Recorder::default();
        std::fs::remove_dir(&blocker).unwrap();
        let report = queue.drain(&target).await.unwrap();
        assert_eq!(*target.seen.lock().unwrap(), vec!["kept"]);
        assert_eq!(report.submitted.len(), 1);

        let next = queue.enqueue("mock", config("after")).await.unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_entry_in_memory_and_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        let queue = OfflineQueue::open(&path).await.unwrap();
        queue.enqueue("mock", config("a")).await.unwrap();

        let _blocker = block_writes(&path);
        assert!(queue.drain(&Recorder::default()).await.is_err());

        let in_memory = queue.pending().await;
        let on_disk = OfflineQueue::open(&path).await.unwrap().pending().await;
        assert_eq!(in_memory, on_disk);
        assert_eq!(in_memory.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("q.json")).await.unwrap();
        let _held = queue.drain_lock.lock().await;

        let err = queue.drain(&Recorder::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DrainInProgress));
    }
}
