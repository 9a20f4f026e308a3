use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{lock_map, Ending, Inner};
use crate::connectors::ServingConnector;
use crate::error::{ErrorKind, Result};
use crate::models::{Deployment, DeploymentStatus, RemoteDeploymentStatus};

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

impl Inner {
    pub(super) async fn run_monitor(
        self: Arc<Self>,
        mut deployment: Deployment,
        connector: Arc<dyn ServingConnector>,
        token: CancellationToken,
    ) {
        let id = deployment.id.clone();
        let lock = self.entity_lock(&id);
        let mut failures = 0u32;

        loop {
            let delay = self.monitor_delay(&deployment, failures);
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            let guard = tokio::select! {
                () = token.cancelled() => break,
                guard = lock.lock() => guard,
            };

            // Scaling swaps may have changed the record since the last step.
            match self.load(&id).await {
                Ok(current) => deployment = current,
                Err(e) => {
                    error!(deployment_id = %id, error = %e, "Monitor lost its deployment");
                    break;
                }
            }
            if deployment.status.is_terminal() {
                break;
            }

            let step = match deployment.status {
                DeploymentStatus::Active => self.health_step(&mut deployment, &connector).await,
                _ => self.deploying_step(&mut deployment, &connector, &mut failures).await,
            };
            drop(guard);

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => break,
                Err(e) => {
                    error!(deployment_id = %id, error = %e, "Monitor stopped on store error");
                    break;
                }
            }
        }

        lock_map(&self.tasks).remove(&id);
        debug!(deployment_id = %id, "Monitor stopped");
    }

    fn monitor_delay(&self, deployment: &Deployment, failures: u32) -> Duration {
        match deployment.status {
            DeploymentStatus::Active => self.config.health_check_interval,
            _ if failures > 0 => self.config.retry.delay_for_attempt(failures - 1),
            _ => self.config.poll_interval,
        }
    }

    fn deploy_expired(&self, deployment: &Deployment) -> bool {
        let since = deployment
            .history
            .iter()
            .rev()
            .find(|t| t.to == DeploymentStatus::Deploying)
            .map_or(deployment.created_at, |t| t.at);
        chrono::Duration::from_std(self.config.deploy_timeout)
            .is_ok_and(|limit| Utc::now() - since > limit)
    }

    async fn deploying_step(
        &self,
        deployment: &mut Deployment,
        connector: &Arc<dyn ServingConnector>,
        failures: &mut u32,
    ) -> Result<Step> {
        let remote_id = deployment.remote_id.clone().unwrap_or_default();

        if self.deploy_expired(deployment) {
            let message = format!("not ready after {:?}", self.config.deploy_timeout);
            self.end(deployment, connector, Ending::Failed(ErrorKind::ProvisionTimeout, message), true)
                .await?;
            return Ok(Step::Finished);
        }

        match self
            .call("get_deployment_status", connector.get_deployment_status(&remote_id))
            .await
        {
            Ok(RemoteDeploymentStatus::Deploying) => {
                *failures = 0;
                Ok(Step::Continue)
            }
            Ok(RemoteDeploymentStatus::Ready { endpoint_url }) => {
                *failures = 0;
                let previous = deployment.status;
                deployment.endpoint_url = Some(endpoint_url);
                deployment.transition(DeploymentStatus::Active)?;
                self.save(deployment, previous).await?;
                info!(
                    deployment_id = %deployment.id,
                    endpoint = deployment.endpoint_url.as_deref().unwrap_or_default(),
                    "Deployment serving"
                );
                Ok(Step::Continue)
            }
            Ok(RemoteDeploymentStatus::Failed { message }) => {
                self.end(deployment, connector, Ending::Failed(ErrorKind::RemoteFailure, message), true)
                    .await?;
                Ok(Step::Finished)
            }
            Ok(RemoteDeploymentStatus::Stopped) => {
                let message = "stopped on the provider side before serving".to_string();
                self.end(deployment, connector, Ending::Failed(ErrorKind::RemoteFailure, message), false)
                    .await?;
                Ok(Step::Finished)
            }
            Err(e) if e.is_retryable() => {
                *failures += 1;
                if self.config.retry.should_retry(*failures) {
                    warn!(deployment_id = %deployment.id, attempt = *failures, error = %e, "Deployment poll failed, backing off");
                    Ok(Step::Continue)
                } else {
                    let message = format!("status poll failed {failures} consecutive times; last error: {e}");
                    self.end(deployment, connector, Ending::Failed(ErrorKind::RetryExhausted, message), true)
                        .await?;
                    Ok(Step::Finished)
                }
            }
            Err(e) => {
                self.end(deployment, connector, Ending::Failed(e.kind(), e.to_string()), true)
                    .await?;
                Ok(Step::Finished)
            }
        }
    }

    async fn health_step(
        &self,
        deployment: &mut Deployment,
        connector: &Arc<dyn ServingConnector>,
    ) -> Result<Step> {
        let remote_id = deployment.remote_id.clone().unwrap_or_default();
        match self
            .call("get_deployment_status", connector.get_deployment_status(&remote_id))
            .await
        {
            Ok(RemoteDeploymentStatus::Failed { message }) => {
                self.end(deployment, connector, Ending::Failed(ErrorKind::RemoteFailure, message), true)
                    .await?;
                return Ok(Step::Finished);
            }
            Ok(RemoteDeploymentStatus::Stopped) => {
                let message = "stopped on the provider side".to_string();
                self.end(deployment, connector, Ending::Failed(ErrorKind::RemoteFailure, message), false)
                    .await?;
                return Ok(Step::Finished);
            }
            Ok(_) => {}
            Err(e) => debug!(deployment_id = %deployment.id, error = %e, "Status check failed, relying on health check"),
        }

        let url = deployment.endpoint_url.clone().unwrap_or_default();
        let healthy = match self.call("health_check", connector.health_check(&url)).await {
            Ok(healthy) => healthy,
            Err(e) if e.kind() == ErrorKind::Auth => {
                self.end(deployment, connector, Ending::Failed(ErrorKind::Auth, e.to_string()), false)
                    .await?;
                return Ok(Step::Finished);
            }
            Err(e) => {
                debug!(deployment_id = %deployment.id, error = %e, "Health check errored");
                false
            }
        };

        if healthy {
            if deployment.health_failures > 0 {
                info!(deployment_id = %deployment.id, "Endpoint healthy again");
                deployment.health_failures = 0;
                self.save(deployment, deployment.status).await?;
            }
            return Ok(Step::Continue);
        }

        deployment.health_failures += 1;
        warn!(
            deployment_id = %deployment.id,
            failures = deployment.health_failures,
            limit = self.config.max_health_failures,
            "Health check failed"
        );
        if deployment.health_failures >= self.config.max_health_failures {
            let message = format!(
                "{} consecutive failed health checks on {url}",
                deployment.health_failures
            );
            self.end(deployment, connector, Ending::Failed(ErrorKind::HealthCheck, message), true)
                .await?;
            return Ok(Step::Finished);
        }
        self.save(deployment, deployment.status).await?;
        Ok(Step::Continue)
    }
}
