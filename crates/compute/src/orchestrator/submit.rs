use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Conclusion, Inner, JobOrchestrator};
use crate::connectors::Connector;
use crate::error::{ConnectorError, ErrorKind, OrchestratorError, Result};
use crate::models::{Job, JobStatus};
use crate::queue::{DrainDisposition, DrainTarget, QueuedSubmission};

impl Inner {
    /// Submit a pending job, walking its candidate resources.
    ///
    /// Capacity errors are retried `provisioning_attempts_per_resource`
    /// times per resource before falling back to the next one. Transient
    /// errors share one retry budget across resources, and every retry after
    /// one asks the provider whether the previous attempt landed.
    pub(super) async fn run_submission(
        self: &Arc<Self>,
        job: &mut Job,
        connector: Arc<dyn Connector>,
        mut check_existing: bool,
    ) -> Result<()> {
        let key = job.idempotency_key.clone();
        let retry = self.config.retry.clone();
        let per_resource = self.config.provisioning_attempts_per_resource.max(1);
        let candidates = job.config.candidate_resources();
        let mut transient_failures = 0u32;
        let mut last_capacity_error = None;

        for resource in &candidates {
            if &job.resource_id != resource {
                info!(job_id = %job.id, from = %job.resource_id, to = %resource, "Falling back to alternate resource");
                job.resource_id.clone_from(resource);
            }
            let mut config = job.config.clone();
            config.resource_id.clone_from(resource);
            let mut capacity_failures = 0u32;

            loop {
                if check_existing {
                    match self.call("find_job", connector.find_job(&key)).await {
                        Ok(Some(remote_id)) => {
                            info!(job_id = %job.id, remote_id = %remote_id, "Earlier submission found on provider");
                            return self.accept(job, connector, remote_id).await;
                        }
                        Ok(None) => check_existing = false,
                        Err(e) if e.is_retryable() => {
                            transient_failures += 1;
                            job.record_retry("find_job", &e, retry.max_retries);
                            if !retry.should_retry(transient_failures) {
                                let message = format!(
                                    "submission lookup failed {transient_failures} times; last error: {e}"
                                );
                                return self
                                    .give_up(job, &connector, ErrorKind::RetryExhausted, message)
                                    .await;
                            }
                            self.store.update_job(job).await?;
                            tokio::time::sleep(retry.delay_for_attempt(transient_failures - 1))
                                .await;
                            continue;
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Submission lookup unavailable, submitting anyway");
                            check_existing = false;
                        }
                    }
                }

                match self.call("submit_job", connector.submit_job(&config, &key)).await {
                    Ok(remote_id) => return self.accept(job, connector, remote_id).await,
                    Err(e @ ConnectorError::Provisioning(_)) => {
                        capacity_failures += 1;
                        job.record_attempt("submit", &e);
                        self.store.update_job(job).await?;
                        warn!(
                            job_id = %job.id,
                            resource_id = %resource,
                            attempt = capacity_failures,
                            error = %e,
                            "No capacity"
                        );
                        if capacity_failures >= per_resource {
                            last_capacity_error = Some(e);
                            break;
                        }
                        tokio::time::sleep(retry.delay_for_attempt(capacity_failures - 1)).await;
                    }
                    Err(e) if e.is_retryable() => {
                        transient_failures += 1;
                        job.record_retry("submit", &e, retry.max_retries);
                        if !retry.should_retry(transient_failures) {
                            let message = format!(
                                "submission failed {transient_failures} times; last error: {e}"
                            );
                            return self
                                .give_up(job, &connector, ErrorKind::RetryExhausted, message)
                                .await;
                        }
                        self.store.update_job(job).await?;
                        let delay = retry.delay_for_attempt(transient_failures - 1);
                        warn!(
                            job_id = %job.id,
                            attempt = transient_failures,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Submission failed, retrying"
                        );
                        check_existing = true;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        return self
                            .conclude(job, &connector, Conclusion::Failed(e.kind(), e.to_string()), false)
                            .await;
                    }
                }
            }
        }

        let message = format!(
            "no capacity on any of [{}]; last error: {}",
            candidates.join(", "),
            last_capacity_error.map_or_else(String::new, |e| e.to_string())
        );
        self.conclude(job, &connector, Conclusion::Failed(ErrorKind::Provisioning, message), false)
            .await
    }

    /// Record the provider's acceptance and start polling.
    async fn accept(
        self: &Arc<Self>,
        job: &mut Job,
        connector: Arc<dyn Connector>,
        remote_id: String,
    ) -> Result<()> {
        let previous = job.status;
        job.remote_id = Some(remote_id);
        job.retry_count = 0;
        job.transition(JobStatus::Provisioning)?;
        self.save(job, previous).await?;
        self.spawn_poller(job.clone(), connector);
        Ok(())
    }

    /// A job that never reached the provider.
    async fn reject(&self, entry: &QueuedSubmission, kind: ErrorKind, message: String) -> Result<Job> {
        let mut job = Job::new(&entry.provider, entry.config.clone(), &entry.idempotency_key);
        job.fail(kind, message)?;
        self.store.create_job(&job).await?;
        Ok(job)
    }
}

#[async_trait]
impl DrainTarget for JobOrchestrator {
    async fn submit_queued(&self, entry: &QueuedSubmission) -> Result<DrainDisposition> {
        let inner = self.inner();
        let key = &entry.idempotency_key;

        if let Some(existing) = inner.store.job_by_idempotency_key(key).await? {
            return Ok(DrainDisposition::Submitted(existing.id));
        }

        if let Err(e) = entry.config.validate() {
            let job = inner.reject(entry, ErrorKind::Validation, e.to_string()).await?;
            return Ok(DrainDisposition::Rejected(job.id));
        }
        let connector = match inner.registry.jobs(&entry.provider) {
            Ok(c) => c,
            Err(e @ OrchestratorError::UnknownProvider(_)) => {
                let job = inner.reject(entry, ErrorKind::Validation, e.to_string()).await?;
                return Ok(DrainDisposition::Rejected(job.id));
            }
            Err(e) => return Err(e),
        };

        match inner.call("find_job", connector.find_job(key)).await {
            Ok(Some(remote_id)) => {
                info!(local_id = %entry.local_id, remote_id = %remote_id, "Queued submission already on provider");
                let mut job = Job::new(&entry.provider, entry.config.clone(), key);
                inner.store.create_job(&job).await?;
                inner.accept(&mut job, connector, remote_id).await?;
                return Ok(DrainDisposition::Submitted(job.id));
            }
            Ok(None) => {}
            Err(e @ (ConnectorError::Auth(_) | ConnectorError::Transient(_))) => {
                return Ok(DrainDisposition::Deferred(e.to_string()));
            }
            Err(e) => warn!(local_id = %entry.local_id, error = %e, "Submission lookup unavailable"),
        }

        match inner.call("submit_job", connector.submit_job(&entry.config, key)).await {
            Ok(remote_id) => {
                let mut job = Job::new(&entry.provider, entry.config.clone(), key);
                inner.store.create_job(&job).await?;
                inner.accept(&mut job, connector, remote_id).await?;
                Ok(DrainDisposition::Submitted(job.id))
            }
            Err(e @ (ConnectorError::Auth(_) | ConnectorError::Transient(_))) => {
                Ok(DrainDisposition::Deferred(e.to_string()))
            }
            Err(ConnectorError::Provisioning(_)) => {
                let mut job = Job::new(&entry.provider, entry.config.clone(), key);
                inner.store.create_job(&job).await?;
                let lock = inner.entity_lock(&job.id);
                let _guard = lock.lock().await;
                inner.run_submission(&mut job, connector, true).await?;
                Ok(DrainDisposition::Submitted(job.id))
            }
            Err(e) => {
                let job = inner.reject(entry, e.kind(), e.to_string()).await?;
                Ok(DrainDisposition::Rejected(job.id))
            }
        }
    }
}
