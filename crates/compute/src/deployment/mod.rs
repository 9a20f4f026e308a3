//! Inference deployment lifecycle.
//!
//! [`DeploymentManager`] mirrors the job orchestrator for serving
//! endpoints: `Pending → Deploying → Active → {Failed, Stopped}`. Each live
//! deployment has one monitor task that waits for the endpoint to come up
//! and then health-checks it. Scaling changes go through the connector's
//! in-place `update_config`; only providers that answer
//! `RequiresRedeploy` get a replacement endpoint, swapped in while the
//! deployment stays `Active`.

mod active;
mod monitor;

pub use active::{ActiveDeployments, ActiveEndpoint};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::connectors::{ConnectorRegistry, ServingConnector};
use crate::error::{ConnectorError, ErrorKind, OrchestratorError, Result};
use crate::metrics::{MetricsAggregator, MetricsReport};
use crate::models::{
    Deployment, DeploymentConfig, DeploymentId, DeploymentStatus, MetricSample,
    RemoteDeploymentStatus, ScalingConfig, UpdateOutcome,
};
use crate::store::Store;

const EVENT_CAPACITY: usize = 256;

/// A deployment changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentEvent {
    /// Deployment that changed.
    pub deployment_id: DeploymentId,
    /// Provider of the deployment.
    pub platform: String,
    /// Status before.
    pub from: DeploymentStatus,
    /// Status after.
    pub to: DeploymentStatus,
    /// When the change was recorded.
    pub at: DateTime<Utc>,
}

/// How a deployment ends.
enum Ending {
    Failed(ErrorKind, String),
    Stopped(Option<(ErrorKind, String)>),
}

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    registry: ConnectorRegistry,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsAggregator>,
    config: ManagerConfig,
    active: ActiveDeployments,
    limiter: Semaphore,
    tasks: Mutex<HashMap<DeploymentId, MonitorTask>>,
    locks: Mutex<HashMap<DeploymentId, Arc<AsyncMutex<()>>>>,
    events: broadcast::Sender<DeploymentEvent>,
}

/// Drives inference deployments across providers.
#[derive(Clone)]
pub struct DeploymentManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("providers", &self.inner.registry.names())
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Inner {
    async fn call<T, F>(&self, operation: &str, call: F) -> Result<T, ConnectorError>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ConnectorError::Transient("manager is shutting down".into()))?;

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Transient(format!(
                "{operation} timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    /// Retry `make_call` on retryable errors with the manager's backoff.
    async fn call_with_retry<T, F, Fut>(&self, operation: &str, mut make_call: F) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut failures = 0u32;
        loop {
            match self.call(operation, make_call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.config.retry.should_retry(failures) => {
                    let delay = self.config.retry.delay_for_attempt(failures);
                    failures += 1;
                    warn!(
                        operation,
                        attempt = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Deployment call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn entity_lock(&self, id: &DeploymentId) -> Arc<AsyncMutex<()>> {
        lock_map(&self.locks)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn load(&self, id: &DeploymentId) -> Result<Deployment> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| OrchestratorError::DeploymentNotFound(id.to_string()))
    }

    async fn save(&self, deployment: &Deployment, previous: DeploymentStatus) -> Result<()> {
        self.store.update_deployment(deployment).await?;
        if deployment.status == DeploymentStatus::Active {
            self.active.upsert(deployment);
        } else {
            self.active.remove(&deployment.id);
        }

        if deployment.status != previous {
            info!(
                deployment_id = %deployment.id,
                platform = %deployment.platform,
                from = %previous,
                to = %deployment.status,
                "Deployment transitioned"
            );
            let _ = self.events.send(DeploymentEvent {
                deployment_id: deployment.id.clone(),
                platform: deployment.platform.clone(),
                from: previous,
                to: deployment.status,
                at: deployment.updated_at,
            });
        }
        Ok(())
    }

    /// Move to a terminal status, tearing down the remote side when asked.
    async fn end(
        &self,
        deployment: &mut Deployment,
        connector: &Arc<dyn ServingConnector>,
        ending: Ending,
        stop_remote: bool,
    ) -> Result<()> {
        let previous = deployment.status;
        match ending {
            Ending::Failed(kind, message) => {
                error!(deployment_id = %deployment.id, kind = %kind, error = %message, "Deployment failed");
                deployment.fail(kind, message)?;
            }
            Ending::Stopped(note) => {
                deployment.transition(DeploymentStatus::Stopped)?;
                if let Some((kind, message)) = note {
                    deployment.error_kind = Some(kind);
                    deployment.error_message = Some(message);
                }
            }
        }

        if stop_remote {
            if let Some(remote_id) = deployment.remote_id.as_deref() {
                if let Err(e) = self.call("stop_deployment", connector.stop_deployment(remote_id)).await {
                    warn!(deployment_id = %deployment.id, remote_id = %remote_id, error = %e, "Failed to stop remote deployment");
                }
            }
        }

        self.save(deployment, previous).await?;
        lock_map(&self.locks).remove(&deployment.id);
        Ok(())
    }

    fn spawn_monitor(self: &Arc<Self>, deployment: Deployment, connector: Arc<dyn ServingConnector>) {
        let mut tasks = lock_map(&self.tasks);
        if tasks.get(&deployment.id).is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        let id = deployment.id.clone();
        let handle = tokio::spawn(self.clone().run_monitor(deployment, connector, token.clone()));
        tasks.insert(id, MonitorTask { token, handle });
    }

    async fn stop_monitor(&self, id: &DeploymentId) {
        let task = lock_map(&self.tasks).remove(id);
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(deployment_id = %id, error = %e, "Monitor ended abnormally");
            }
        }
    }

    /// Poll a new remote deployment until it serves, fails or times out.
    async fn await_ready(
        &self,
        connector: &Arc<dyn ServingConnector>,
        remote_id: &str,
    ) -> Result<String, ConnectorError> {
        let deadline = tokio::time::Instant::now() + self.config.deploy_timeout;
        let mut failures = 0u32;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ConnectorError::Provisioning(format!(
                    "replacement {remote_id} not ready after {:?}",
                    self.config.deploy_timeout
                )));
            }
            match self
                .call("get_deployment_status", connector.get_deployment_status(remote_id))
                .await
            {
                Ok(RemoteDeploymentStatus::Ready { endpoint_url }) => return Ok(endpoint_url),
                Ok(RemoteDeploymentStatus::Deploying) => failures = 0,
                Ok(RemoteDeploymentStatus::Failed { message }) => {
                    return Err(ConnectorError::Validation(message))
                }
                Ok(RemoteDeploymentStatus::Stopped) => {
                    return Err(ConnectorError::NotFound(format!("{remote_id} stopped")))
                }
                Err(e) if e.is_retryable() && self.config.retry.should_retry(failures) => {
                    failures += 1;
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

impl DeploymentManager {
    /// Create a manager over `registry` persisting to `store` and feeding
    /// `metrics`.
    #[must_use]
    pub fn new(
        registry: ConnectorRegistry,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsAggregator>,
        config: ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                limiter: Semaphore::new(config.max_concurrency.max(1)),
                registry,
                store,
                metrics,
                config,
                active: ActiveDeployments::new(),
                tasks: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Start a deployment.
    ///
    /// Returns once the provider accepted it (`Deploying`) or refused for
    /// good (`Failed`).
    ///
    /// # Errors
    /// Returns `Validation`, `UnknownProvider` or a store error.
    pub async fn deploy(&self, platform: &str, config: DeploymentConfig) -> Result<Deployment> {
        config.validate()?;
        let connector = self.inner.registry.serving(platform)?;

        let mut deployment = Deployment::new(platform, config);
        self.inner.store.create_deployment(&deployment).await?;
        info!(deployment_id = %deployment.id, platform = %platform, "Deployment created");

        let lock = self.inner.entity_lock(&deployment.id);
        let _guard = lock.lock().await;

        let created = self
            .inner
            .call_with_retry("create_deployment", || {
                connector.create_deployment(&deployment.config)
            })
            .await;

        match created {
            Ok(remote_id) => {
                let previous = deployment.status;
                deployment.remote_id = Some(remote_id);
                deployment.transition(DeploymentStatus::Deploying)?;
                self.inner.save(&deployment, previous).await?;
                self.inner.spawn_monitor(deployment.clone(), connector);
            }
            Err(e) => {
                let kind = if e.is_retryable() {
                    ErrorKind::RetryExhausted
                } else {
                    e.kind()
                };
                self.inner
                    .end(&mut deployment, &connector, Ending::Failed(kind, e.to_string()), false)
                    .await?;
            }
        }
        Ok(deployment)
    }

    /// Current record of a deployment.
    ///
    /// # Errors
    /// Returns `DeploymentNotFound` or a store error.
    pub async fn status(&self, id: &DeploymentId) -> Result<Deployment> {
        self.inner.load(id).await
    }

    /// Deployments in any of `statuses` (all when empty), oldest first.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn list(&self, statuses: &[DeploymentStatus]) -> Result<Vec<Deployment>> {
        self.inner.store.deployments_by_status(statuses).await
    }

    /// Apply new scaling to an active deployment.
    ///
    /// Re-applying the current scaling returns without calling the
    /// provider. When the provider cannot change it in place, a replacement
    /// endpoint is deployed and swapped in; the old one is stopped after the
    /// swap.
    ///
    /// # Errors
    /// Returns `Validation` for bad scaling or a deployment that is not
    /// `Active`, or the connector error if the change could not be made
    /// (the deployment keeps its previous scaling).
    pub async fn update_scaling(&self, id: &DeploymentId, scaling: ScalingConfig) -> Result<Deployment> {
        scaling.validate()?;
        let inner = &self.inner;
        let lock = inner.entity_lock(id);
        let _guard = lock.lock().await;

        let mut deployment = inner.load(id).await?;
        if deployment.status != DeploymentStatus::Active {
            return Err(OrchestratorError::Validation(format!(
                "deployment {id} is {}, scaling needs active",
                deployment.status
            )));
        }
        if deployment.config.scaling == scaling {
            debug!(deployment_id = %id, "Scaling unchanged");
            return Ok(deployment);
        }

        let connector = inner.registry.serving(&deployment.platform)?;
        let remote_id = deployment.remote_id.clone().unwrap_or_default();
        let outcome = inner
            .call_with_retry("update_config", || connector.update_config(&remote_id, &scaling))
            .await?;

        match outcome {
            UpdateOutcome::Applied => {
                info!(deployment_id = %id, ?scaling, "Scaling applied in place");
            }
            UpdateOutcome::RequiresRedeploy => {
                info!(deployment_id = %id, "Provider requires redeploy for scaling change");
                let mut replacement_config = deployment.config.clone();
                replacement_config.scaling = scaling.clone();

                let new_remote = inner
                    .call_with_retry("create_deployment", || {
                        connector.create_deployment(&replacement_config)
                    })
                    .await?;
                let endpoint_url = match inner.await_ready(&connector, &new_remote).await {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(deployment_id = %id, remote_id = %new_remote, error = %e, "Replacement failed, keeping current endpoint");
                        let _ = inner
                            .call("stop_deployment", connector.stop_deployment(&new_remote))
                            .await;
                        return Err(e.into());
                    }
                };

                let old_remote = deployment.remote_id.replace(new_remote);
                deployment.endpoint_url = Some(endpoint_url);
                if let Some(old) = old_remote {
                    match inner.call("stop_deployment", connector.stop_deployment(&old)).await {
                        Ok(true) => debug!(deployment_id = %id, remote_id = %old, "Old endpoint stopped"),
                        Ok(false) => warn!(deployment_id = %id, remote_id = %old, "Stop of old endpoint not acknowledged"),
                        Err(e) => warn!(deployment_id = %id, remote_id = %old, error = %e, "Failed to stop old endpoint"),
                    }
                }
            }
        }

        deployment.config.scaling = scaling;
        deployment.updated_at = Utc::now();
        inner.save(&deployment, deployment.status).await?;
        Ok(deployment)
    }

    /// Stop a deployment.
    ///
    /// Without an acknowledgement within the grace period it is still
    /// marked `Stopped`, with error kind `cancel_timeout`. Terminal
    /// deployments are returned unchanged.
    ///
    /// # Errors
    /// Returns `DeploymentNotFound`, `UnknownProvider` or a store error.
    pub async fn stop(&self, id: &DeploymentId) -> Result<Deployment> {
        let inner = &self.inner;
        let lock = inner.entity_lock(id);
        let _guard = lock.lock().await;
        inner.stop_monitor(id).await;

        let mut deployment = inner.load(id).await?;
        if deployment.status.is_terminal() {
            return Ok(deployment);
        }

        let connector = inner.registry.serving(&deployment.platform)?;
        let grace = inner.config.stop_grace_period;
        let note = match deployment.remote_id.clone() {
            None => None,
            Some(remote_id) => {
                let acknowledged = tokio::time::timeout(
                    grace,
                    inner.call("stop_deployment", connector.stop_deployment(&remote_id)),
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
                        warn!(deployment_id = %id, remote_id = %remote_id, reason = %reason, "Forcing local stop");
                        Some((
                            ErrorKind::CancelTimeout,
                            format!("stop of remote deployment {remote_id} {reason}; marked stopped locally"),
                        ))
                    }
                }
            }
        };

        inner
            .end(&mut deployment, &connector, Ending::Stopped(note), false)
            .await?;
        Ok(deployment)
    }

    /// Ingest request samples for a deployment.
    ///
    /// Samples already seen are ignored; new ones are appended to the store.
    /// Returns how many were new.
    ///
    /// # Errors
    /// Returns `DeploymentNotFound`, `Validation` for bad samples, or a
    /// store error.
    pub async fn record_samples(&self, id: &DeploymentId, samples: &[MetricSample]) -> Result<usize> {
        let deployment = self.inner.load(id).await?;
        let accepted = self.inner.metrics.ingest(&deployment.metrics_ref, samples)?;
        if !accepted.is_empty() {
            self.inner.store.append_samples(id, &accepted).await?;
        }
        Ok(accepted.len())
    }

    /// Rolling statistics for a deployment.
    ///
    /// # Errors
    /// Returns `DeploymentNotFound` or a store error.
    pub async fn metrics(&self, id: &DeploymentId) -> Result<MetricsReport> {
        let deployment = self.inner.load(id).await?;
        Ok(self.inner.metrics.report(&deployment.metrics_ref))
    }

    /// Endpoints currently serving.
    #[must_use]
    pub fn active(&self) -> Vec<ActiveEndpoint> {
        self.inner.active.list()
    }

    /// Reload live deployments from the store: rebuild the active registry
    /// and metric windows and re-attach one monitor per deployment.
    /// Deployments left `Pending` by a crash never reached the provider and
    /// are marked failed. Returns the number of monitors started.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn resume(&self) -> Result<usize> {
        let inner = &self.inner;
        inner.active.load_from(inner.store.as_ref()).await?;
        let live = inner.store.deployments_by_status(&DeploymentStatus::LIVE).await?;
        let mut resumed = 0;

        for mut deployment in live {
            let samples = inner.store.load_samples(&deployment.id).await?;
            if let Err(e) = inner.metrics.ingest(&deployment.metrics_ref, &samples) {
                warn!(deployment_id = %deployment.id, error = %e, "Skipping stored samples");
            }

            let connector = match inner.registry.serving(&deployment.platform) {
                Ok(c) => c,
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "Cannot resume deployment");
                    continue;
                }
            };

            if deployment.status == DeploymentStatus::Pending {
                inner
                    .end(
                        &mut deployment,
                        &connector,
                        Ending::Failed(
                            ErrorKind::Transient,
                            "interrupted before the provider accepted the deployment".into(),
                        ),
                        false,
                    )
                    .await?;
                continue;
            }

            info!(deployment_id = %deployment.id, status = %deployment.status, "Resuming deployment");
            inner.spawn_monitor(deployment, connector);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the deployment is in one of `statuses`.
    ///
    /// # Errors
    /// Returns `Timeout`, `DeploymentNotFound` or a store error.
    pub async fn wait_for_status(
        &self,
        id: &DeploymentId,
        statuses: &[DeploymentStatus],
        timeout: Duration,
    ) -> Result<Deployment> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                let deployment = self.inner.load(id).await?;
                if statuses.contains(&deployment.status) {
                    return Ok(deployment);
                }
                loop {
                    match events.recv().await {
                        Ok(event) if &event.deployment_id == id => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(OrchestratorError::DeploymentNotFound(id.to_string()))
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout))?
    }

    /// Stop every monitor without touching the deployments.
    pub async fn shutdown(&self) {
        let ids: Vec<DeploymentId> = lock_map(&self.inner.tasks).keys().cloned().collect();
        for id in ids {
            self.inner.stop_monitor(&id).await;
        }
    }
}
