//! Training job orchestration.
//!
//! The [`JobOrchestrator`] owns every non-terminal [`Job`]. Submission
//! happens inline in the caller's task; once the provider accepts the job a
//! dedicated poller task drives it through
//! `Provisioning → Running → {Completed, Failed, Cancelled}`.
//!
//! ## Concurrency
//!
//! - One poller task per active job, tracked in a task map.
//! - Every connector call takes a permit from a shared semaphore and runs
//!   under `call_timeout`; an expired timeout is a transient error.
//! - Each job has its own async lock. Only its holder may write the job
//!   record: the submitting caller, the poller during a poll step, or
//!   `cancel`.
//!
//! ## Example
//!
//! ```ignore
//! let orchestrator = JobOrchestrator::new(registry, store, OrchestratorConfig::from_env());
//! let job = orchestrator.submit("lambda", config, None).await?;
//! let done = orchestrator.wait_for_terminal(&job.id, Duration::from_secs(3600)).await?;
//! ```

mod poller;
mod submit;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::connectors::{Connector, ConnectorRegistry};
use crate::error::{ConnectorError, ErrorKind, OrchestratorError, Result};
use crate::logs::{log_stream, LogStreamOptions, StreamRegistry};
use crate::models::{new_idempotency_key, Job, JobConfig, JobId, JobStatus, LogLine};
use crate::store::Store;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 256;

/// A job changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    /// Job that changed.
    pub job_id: JobId,
    /// Provider of the job.
    pub provider: String,
    /// Status before.
    pub from: JobStatus,
    /// Status after.
    pub to: JobStatus,
    /// When the change was recorded.
    pub at: DateTime<Utc>,
}

/// How a job ends.
pub(crate) enum Conclusion {
    Completed,
    Failed(ErrorKind, String),
    Cancelled(Option<(ErrorKind, String)>),
}

struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct Inner {
    registry: ConnectorRegistry,
    store: Arc<dyn Store>,
    config: OrchestratorConfig,
    limiter: Semaphore,
    tasks: Mutex<HashMap<JobId, PollTask>>,
    locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
    streams: StreamRegistry<JobId>,
    events: broadcast::Sender<JobEvent>,
}

/// Drives training jobs across providers.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("providers", &self.inner.registry.names())
            .field("active_tasks", &self.active_tasks())
            .finish_non_exhaustive()
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Inner {
    /// Run a connector call under the concurrency limit and call timeout.
    pub(crate) async fn call<T, F>(&self, operation: &str, call: F) -> Result<T, ConnectorError>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ConnectorError::Transient("orchestrator is shutting down".into()))?;

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Transient(format!(
                "{operation} timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    fn entity_lock(&self, id: &JobId) -> Arc<AsyncMutex<()>> {
        lock_map(&self.locks)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn forget(&self, id: &JobId) {
        lock_map(&self.locks).remove(id);
    }

    /// Persist `job` and publish an event if its status moved off `previous`.
    pub(crate) async fn save(&self, job: &Job, previous: JobStatus) -> Result<()> {
        self.store.update_job(job).await?;
        if job.status != previous {
            info!(
                job_id = %job.id,
                provider = %job.provider,
                from = %previous,
                to = %job.status,
                "Job transitioned"
            );
            // No subscribers is fine.
            let _ = self.events.send(JobEvent {
                job_id: job.id.clone(),
                provider: job.provider.clone(),
                from: previous,
                to: job.status,
                at: job.history.last().map_or_else(Utc::now, |t| t.at),
            });
        }
        Ok(())
    }

    /// Move `job` to a terminal status, price it, persist it and, when
    /// `release` is set, free its remote resources.
    pub(crate) async fn conclude(
        &self,
        job: &mut Job,
        connector: &Arc<dyn Connector>,
        conclusion: Conclusion,
        release: bool,
    ) -> Result<()> {
        let previous = job.status;
        match conclusion {
            Conclusion::Completed => job.transition(JobStatus::Completed)?,
            Conclusion::Failed(kind, message) => {
                error!(job_id = %job.id, kind = %kind, error = %message, "Job failed");
                job.fail(kind, message)?;
            }
            Conclusion::Cancelled(note) => {
                job.transition(JobStatus::Cancelled)?;
                if let Some((kind, message)) = note {
                    job.error_kind = Some(kind);
                    job.error_message = Some(message);
                }
            }
        }

        if job.started_at.is_some() {
            match self
                .call("get_pricing", connector.get_pricing(&job.resource_id))
                .await
            {
                Ok(pricing) => job.estimated_cost = Some(pricing.hourly_rate * job.running_hours()),
                Err(e) => debug!(job_id = %job.id, error = %e, "Pricing unavailable"),
            }
        }

        self.save(job, previous).await?;

        if release {
            if let Some(remote_id) = job.remote_id.as_deref() {
                if let Err(e) = self.call("release_job", connector.release_job(remote_id)).await {
                    warn!(job_id = %job.id, remote_id = %remote_id, error = %e, "Failed to release remote resources");
                }
            }
        }
        Ok(())
    }

    /// Start the poller for `job` unless one is already running.
    pub(crate) fn spawn_poller(self: &Arc<Self>, job: Job, connector: Arc<dyn Connector>) {
        let mut tasks = lock_map(&self.tasks);
        if tasks.get(&job.id).is_some_and(|t| !t.handle.is_finished()) {
            debug!(job_id = %job.id, "Poller already running");
            return;
        }

        let token = CancellationToken::new();
        let id = job.id.clone();
        let handle = tokio::spawn(self.clone().run_poller(job, connector, token.clone()));
        tasks.insert(id, PollTask { token, handle });
    }

    fn finish_task(&self, id: &JobId) {
        lock_map(&self.tasks).remove(id);
        self.forget(id);
    }

    async fn load(&self, id: &JobId) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))
    }
}

impl JobOrchestrator {
    /// Create an orchestrator over `registry` persisting to `store`.
    #[must_use]
    pub fn new(registry: ConnectorRegistry, store: Arc<dyn Store>, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                limiter: Semaphore::new(config.max_concurrency.max(1)),
                registry,
                store,
                config,
                tasks: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                streams: StreamRegistry::new(),
                events,
            }),
        }
    }

    /// Submit a job.
    ///
    /// Returns once the provider accepted the job (`Provisioning`) or the
    /// submission failed for good (`Failed`). A key that already has a local
    /// job returns that job unchanged.
    ///
    /// # Errors
    /// Returns `Validation` for invalid configs, `UnknownProvider`, or store
    /// errors. Provider-side failures are recorded on the returned job.
    pub async fn submit(
        &self,
        provider: &str,
        config: JobConfig,
        idempotency_key: Option<String>,
    ) -> Result<Job> {
        config.validate()?;
        let connector = self.inner.registry.jobs(provider)?;
        let key = idempotency_key.unwrap_or_else(new_idempotency_key);

        if let Some(existing) = self.inner.store.job_by_idempotency_key(&key).await? {
            info!(job_id = %existing.id, key = %key, "Submission already known, returning existing job");
            return Ok(existing);
        }

        let mut job = Job::new(provider, config, key);
        self.inner.store.create_job(&job).await?;
        info!(job_id = %job.id, provider = %provider, resource_id = %job.resource_id, "Job created");

        let lock = self.inner.entity_lock(&job.id);
        let _guard = lock.lock().await;
        self.inner.run_submission(&mut job, connector, false).await?;
        Ok(job)
    }

    /// Current record of a job.
    ///
    /// # Errors
    /// Returns `JobNotFound` or a store error.
    pub async fn status(&self, id: &JobId) -> Result<Job> {
        self.inner.load(id).await
    }

    /// Jobs in any of `statuses` (all jobs when empty), oldest first.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn list(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        self.inner.store.jobs_by_status(statuses).await
    }

    /// Cancel a job.
    ///
    /// Stops the poller after its in-flight call, asks the provider to
    /// cancel, and marks the job `Cancelled`. Without an acknowledgement
    /// within the grace period the job is still marked `Cancelled`, with
    /// error kind `cancel_timeout`. Terminal jobs are returned unchanged.
    ///
    /// # Errors
    /// Returns `JobNotFound`, `UnknownProvider` or a store error.
    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        let inner = &self.inner;
        let lock = inner.entity_lock(id);
        let _guard = lock.lock().await;

        let task = lock_map(&inner.tasks).remove(id);
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(job_id = %id, error = %e, "Poller ended abnormally");
            }
        }

        let mut job = inner.load(id).await?;
        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "Cancel on terminal job ignored");
            return Ok(job);
        }
        inner.streams.end(id);

        let connector = inner.registry.jobs(&job.provider)?;
        let grace = inner.config.cancel_grace_period;
        let note = match job.remote_id.clone() {
            None => None,
            Some(remote_id) => {
                info!(job_id = %id, remote_id = %remote_id, "Requesting remote cancellation");
                let acknowledged = tokio::time::timeout(
                    grace,
                    inner.call("cancel_job", connector.cancel_job(&remote_id)),
                )
                .await;
                match acknowledged {
                    Ok(Ok(true)) => None,
                    outcome => {
                        let reason = match outcome {
                            Ok(Ok(_)) => "not acknowledged".to_string(),
                            Ok(Err(e)) => e.to_string(),
                            Err(_) => format!("no answer within {grace:?}"),
                        };
                        warn!(job_id = %id, remote_id = %remote_id, reason = %reason, "Forcing local cancellation");
                        Some((
                            ErrorKind::CancelTimeout,
                            format!(
                                "cancellation of remote job {remote_id} {reason}; \
                                 marked cancelled locally, remote teardown not guaranteed"
                            ),
                        ))
                    }
                }
            }
        };

        inner
            .conclude(&mut job, &connector, Conclusion::Cancelled(note), true)
            .await?;
        inner.forget(id);
        Ok(job)
    }

    /// Stream the job's log from cursor `from_offset`.
    ///
    /// A job has at most one live log stream: opening another ends the
    /// previous one, so a reconnecting client takes over from its stale
    /// stream. Cancelling the job ends its stream too.
    ///
    /// # Errors
    /// Returns `JobNotFound`, `UnknownProvider`, or `Validation` if the
    /// provider never accepted the job.
    pub async fn stream_logs(
        &self,
        id: &JobId,
        from_offset: u64,
    ) -> Result<BoxStream<'static, Result<LogLine, ConnectorError>>> {
        let job = self.inner.load(id).await?;
        let remote_id = job.remote_id.ok_or_else(|| {
            OrchestratorError::Validation(format!("job {id} was never accepted by the provider"))
        })?;
        let connector = self.inner.registry.jobs(&job.provider)?;
        let options = LogStreamOptions {
            poll_interval: self.inner.config.poll_interval,
            retry: self.inner.config.retry.clone(),
            call_timeout: self.inner.config.call_timeout,
        };
        let stream = log_stream(connector, remote_id, from_offset, options);
        Ok(self.inner.streams.attach(id.clone(), stream))
    }

    /// Whether the job has a live log stream.
    #[must_use]
    pub fn has_log_stream(&self, id: &JobId) -> bool {
        self.inner.streams.is_live(id)
    }

    /// Bytes of a completed job's artifact.
    ///
    /// # Errors
    /// Returns `ArtifactNotReady` for active jobs, `ArtifactNotFound` for
    /// jobs that did not complete, or the connector/filesystem error.
    pub async fn fetch_artifact(&self, id: &JobId) -> Result<Vec<u8>> {
        let job = self.inner.load(id).await?;
        match job.status {
            JobStatus::Completed => {}
            status if status.is_terminal() => {
                return Err(ConnectorError::ArtifactNotFound(id.to_string()).into())
            }
            _ => return Err(ConnectorError::ArtifactNotReady(id.to_string()).into()),
        }

        if let Some(path) = job
            .artifact_ref
            .as_deref()
            .filter(|r| !r.contains("://"))
            .map(PathBuf::from)
        {
            return Ok(tokio::fs::read(&path).await?);
        }

        let remote_id = job
            .remote_id
            .ok_or_else(|| ConnectorError::ArtifactNotFound(id.to_string()))?;
        let connector = self.inner.registry.jobs(&job.provider)?;
        Ok(self
            .inner
            .call("fetch_artifact", connector.fetch_artifact(&remote_id))
            .await?)
    }

    /// Re-attach to every non-terminal job in the store.
    ///
    /// Accepted jobs get a poller; jobs left `Pending` by a crash are
    /// re-submitted after checking whether the provider already has them.
    /// Returns the number of jobs resumed.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn resume(&self) -> Result<usize> {
        let jobs = self.inner.store.jobs_by_status(&JobStatus::ACTIVE).await?;
        let count = jobs.len();

        for mut job in jobs {
            let connector = match self.inner.registry.jobs(&job.provider) {
                Ok(c) => c,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Cannot resume job");
                    continue;
                }
            };
            info!(job_id = %job.id, status = %job.status, "Resuming job");

            if job.status == JobStatus::Pending {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let lock = inner.entity_lock(&job.id);
                    let _guard = lock.lock().await;
                    if let Err(e) = inner.run_submission(&mut job, connector, true).await {
                        error!(job_id = %job.id, error = %e, "Resubmission failed");
                    }
                });
            } else {
                self.inner.spawn_poller(job, connector);
            }
        }
        Ok(count)
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the job is terminal.
    ///
    /// # Errors
    /// Returns `Timeout` if the job is still active after `timeout`,
    /// `JobNotFound`, or a store error.
    pub async fn wait_for_terminal(&self, id: &JobId, timeout: Duration) -> Result<Job> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                let job = self.inner.load(id).await?;
                if job.status.is_terminal() {
                    return Ok(job);
                }
                loop {
                    match events.recv().await {
                        Ok(event) if &event.job_id == id && event.to.is_terminal() => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(OrchestratorError::JobNotFound(id.to_string()))
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout))?
    }

    /// Number of running poller tasks.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        lock_map(&self.inner.tasks)
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Stop every poller without touching the jobs; `resume` picks them up.
    pub async fn shutdown(&self) {
        let tasks: Vec<PollTask> = lock_map(&self.inner.tasks)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}
