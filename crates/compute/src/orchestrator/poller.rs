use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Conclusion, Inner};
use crate::config::ExhaustionPolicy;
use crate::connectors::Connector;
use crate::error::{ConnectorError, ErrorKind, Result};
use crate::models::{Job, JobStatus, RemoteJobStatus};

/// Whether the poller keeps going after a step.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

impl Inner {
    pub(super) async fn run_poller(
        self: Arc<Self>,
        mut job: Job,
        connector: Arc<dyn Connector>,
        token: CancellationToken,
    ) {
        let id = job.id.clone();
        let lock = self.entity_lock(&id);
        debug!(job_id = %id, "Poller started");

        loop {
            let delay = self.next_delay(&job);
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let guard = tokio::select! {
                () = token.cancelled() => break,
                guard = lock.lock() => guard,
            };
            let step = self.poll_step(&mut job, &connector).await;
            drop(guard);

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => {
                    self.finish_task(&id);
                    break;
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "Poller stopped on store error");
                    self.finish_task(&id);
                    break;
                }
            }
        }
        debug!(job_id = %id, "Poller stopped");
    }

    fn next_delay(&self, job: &Job) -> Duration {
        if job.retry_count == 0 {
            self.config.poll_interval
        } else {
            self.config.retry.delay_for_attempt(job.retry_count - 1)
        }
    }

    fn provisioning_expired(&self, job: &Job) -> bool {
        if job.status != JobStatus::Provisioning {
            return false;
        }
        let Some(submitted) = job.submitted_at else {
            return false;
        };
        chrono::Duration::from_std(self.config.provisioning_timeout)
            .is_ok_and(|limit| Utc::now() - submitted > limit)
    }

    async fn poll_step(&self, job: &mut Job, connector: &Arc<dyn Connector>) -> Result<Step> {
        let Some(remote_id) = job.remote_id.clone() else {
            self.conclude(
                job,
                connector,
                Conclusion::Failed(ErrorKind::Validation, "job has no remote id".into()),
                false,
            )
            .await?;
            return Ok(Step::Finished);
        };

        if self.provisioning_expired(job) {
            let message = format!(
                "still provisioning after {:?}",
                self.config.provisioning_timeout
            );
            self.give_up(job, connector, ErrorKind::ProvisionTimeout, message)
                .await?;
            return Ok(Step::Finished);
        }

        match self
            .call("get_job_status", connector.get_job_status(&remote_id))
            .await
        {
            Ok(remote) => {
                if job.retry_count > 0 {
                    info!(job_id = %job.id, after = job.retry_count, "Status poll recovered");
                    job.retry_count = 0;
                    self.store.update_job(job).await?;
                }
                self.apply_remote_status(job, connector, remote).await
            }
            Err(e) if e.is_retryable() => {
                job.record_retry("status", &e, self.config.retry.max_retries);
                if self.config.retry.should_retry(job.retry_count) {
                    warn!(
                        job_id = %job.id,
                        attempt = job.retry_count,
                        error = %e,
                        "Status poll failed, backing off"
                    );
                    self.store.update_job(job).await?;
                    Ok(Step::Continue)
                } else {
                    let message = format!(
                        "status poll failed {} consecutive times; last error: {e}",
                        job.retry_count
                    );
                    self.give_up(job, connector, ErrorKind::RetryExhausted, message)
                        .await?;
                    Ok(Step::Finished)
                }
            }
            Err(e) => {
                self.conclude(job, connector, Conclusion::Failed(e.kind(), e.to_string()), true)
                    .await?;
                Ok(Step::Finished)
            }
        }
    }

    async fn apply_remote_status(
        &self,
        job: &mut Job,
        connector: &Arc<dyn Connector>,
        remote: RemoteJobStatus,
    ) -> Result<Step> {
        match remote {
            RemoteJobStatus::Queued | RemoteJobStatus::Provisioning => Ok(Step::Continue),
            RemoteJobStatus::Running => {
                self.mark_running(job).await?;
                Ok(Step::Continue)
            }
            RemoteJobStatus::Succeeded => {
                self.mark_running(job).await?;
                self.complete(job, connector).await?;
                Ok(Step::Finished)
            }
            RemoteJobStatus::Failed(message) => {
                self.conclude(
                    job,
                    connector,
                    Conclusion::Failed(ErrorKind::RemoteFailure, message),
                    true,
                )
                .await?;
                Ok(Step::Finished)
            }
            RemoteJobStatus::Cancelled => {
                let note = (ErrorKind::RemoteFailure, "cancelled on the provider side".to_string());
                self.conclude(job, connector, Conclusion::Cancelled(Some(note)), true)
                    .await?;
                Ok(Step::Finished)
            }
        }
    }

    async fn mark_running(&self, job: &mut Job) -> Result<()> {
        if job.status == JobStatus::Provisioning {
            let previous = job.status;
            job.transition(JobStatus::Running)?;
            self.save(job, previous).await?;
        }
        Ok(())
    }

    /// Confirm the artifact and finish the job.
    ///
    /// A job is only `Completed` once its artifact has been fetched.
    async fn complete(&self, job: &mut Job, connector: &Arc<dyn Connector>) -> Result<()> {
        let remote_id = job.remote_id.clone().unwrap_or_default();
        let retries = self.config.artifact_retries;
        let mut failures = 0u32;

        let bytes = loop {
            match self
                .call("fetch_artifact", connector.fetch_artifact(&remote_id))
                .await
            {
                Ok(bytes) => break bytes,
                Err(e) if e.is_retryable() && failures < retries => {
                    job.record_attempt("artifact", &e);
                    let delay = self.config.retry.delay_for_attempt(failures);
                    failures += 1;
                    debug!(job_id = %job.id, attempt = failures, error = %e, "Artifact not available yet");
                    self.store.update_job(job).await?;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let kind = match e {
                        ConnectorError::Auth(_) => ErrorKind::Auth,
                        _ => ErrorKind::ArtifactNotFound,
                    };
                    let message = format!(
                        "provider reported success but the artifact could not be fetched after {} attempts: {e}",
                        failures + 1
                    );
                    return self
                        .conclude(job, connector, Conclusion::Failed(kind, message), true)
                        .await;
                }
            }
        };

        job.retry_count = 0;
        job.artifact_ref = Some(self.store_artifact(job, &bytes).await);
        info!(
            job_id = %job.id,
            artifact = job.artifact_ref.as_deref().unwrap_or_default(),
            bytes = bytes.len(),
            "Artifact confirmed"
        );
        self.conclude(job, connector, Conclusion::Completed, true).await
    }

    /// Local path when an artifact directory is configured, otherwise a
    /// `provider://remote_id` reference.
    async fn store_artifact(&self, job: &Job, bytes: &[u8]) -> String {
        let remote = format!(
            "{}://{}",
            job.provider,
            job.remote_id.as_deref().unwrap_or_default()
        );
        let Some(dir) = &self.config.artifact_dir else {
            return remote;
        };

        match write_artifact(dir, &job.id.to_string(), bytes).await {
            Ok(path) => path,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to write artifact locally, keeping remote reference");
                remote
            }
        }
    }

    /// Fail a job that ran out of retries or time, applying the
    /// exhaustion policy to whatever runs on the provider.
    pub(super) async fn give_up(
        &self,
        job: &mut Job,
        connector: &Arc<dyn Connector>,
        kind: ErrorKind,
        message: String,
    ) -> Result<()> {
        match self.config.exhaustion_policy {
            ExhaustionPolicy::CancelRemote => {
                let remote_id = match job.remote_id.clone() {
                    Some(id) => Some(id),
                    None => self
                        .call("find_job", connector.find_job(&job.idempotency_key))
                        .await
                        .ok()
                        .flatten(),
                };
                let note = match remote_id {
                    Some(remote_id) => {
                        match self.call("cancel_job", connector.cancel_job(&remote_id)).await {
                            Ok(true) => format!("; remote job {remote_id} cancelled"),
                            Ok(false) => format!("; cancel of remote job {remote_id} not acknowledged"),
                            Err(e) => format!("; cancel of remote job {remote_id} failed: {e}"),
                        }
                    }
                    None => String::new(),
                };
                self.conclude(job, connector, Conclusion::Failed(kind, message + &note), true)
                    .await
            }
            ExhaustionPolicy::LeaveRunning => {
                let note = job
                    .remote_id
                    .as_deref()
                    .map(|id| format!("; remote job {id} left running for manual reconciliation"))
                    .unwrap_or_default();
                self.conclude(job, connector, Conclusion::Failed(kind, message + &note), false)
                    .await
            }
        }
    }
}

async fn write_artifact(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<String> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{name}.bin"));
    let tmp = dir.join(format!("{name}.bin.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path.to_string_lossy().into_owned())
}
