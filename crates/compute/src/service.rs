//! One facade over the orchestrator, deployment manager, offline queue and
//! metrics, with an operation per UI/API action.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tracing::info;

use crate::config::{ManagerConfig, OrchestratorConfig, Settings, WindowConfig};
use crate::connectors::ConnectorRegistry;
use crate::credentials::CredentialStore;
use crate::deployment::{ActiveEndpoint, DeploymentManager};
use crate::error::{ConnectorError, Result};
use crate::metrics::{MetricsAggregator, MetricsReport};
use crate::models::{
    ConnectionHandle, Deployment, DeploymentConfig, DeploymentId, DeploymentStatus, Job,
    JobConfig, JobId, JobStatus, LogLine, MetricSample, PricingInfo, Resource, ScalingConfig,
};
use crate::orchestrator::JobOrchestrator;
use crate::queue::{
    ConnectivityMonitor, ConnectivityProbe, DrainReport, OfflineQueue, QueuedSubmission,
};
use crate::store::{FileStore, Store};

/// Where a submission went.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Handed to the provider (the job may still have failed).
    Submitted(Job),
    /// Offline; queued for the next drain.
    Queued(QueuedSubmission),
}

/// Facade used by the CLI and any API layer.
#[derive(Debug, Clone)]
pub struct ComputeService {
    registry: ConnectorRegistry,
    orchestrator: JobOrchestrator,
    deployments: DeploymentManager,
    queue: Arc<OfflineQueue>,
    online: Arc<AtomicBool>,
}

impl ComputeService {
    /// Wire the components together. The service starts online.
    #[must_use]
    pub fn new(
        registry: ConnectorRegistry,
        store: Arc<dyn Store>,
        queue: Arc<OfflineQueue>,
        orchestrator_config: OrchestratorConfig,
        manager_config: ManagerConfig,
        window: WindowConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsAggregator::new(window));
        Self {
            orchestrator: JobOrchestrator::new(registry.clone(), store.clone(), orchestrator_config),
            deployments: DeploymentManager::new(registry.clone(), store, metrics, manager_config),
            registry,
            queue,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Build from a settings file: connectors from the provider list, a
    /// file store under `state_dir/store` and the queue at
    /// `state_dir/queue.json`.
    ///
    /// # Errors
    /// Returns `Config` for bad provider entries or an I/O error for the
    /// state directory.
    pub async fn from_settings(
        settings: &Settings,
        orchestrator_config: OrchestratorConfig,
        manager_config: ManagerConfig,
    ) -> Result<Self> {
        let registry = ConnectorRegistry::from_settings(&settings.providers)?;
        let store = Arc::new(FileStore::open(settings.state_dir.join("store")).await?);
        let queue = Arc::new(OfflineQueue::open(settings.state_dir.join("queue.json")).await?);
        Ok(Self::new(
            registry,
            store,
            queue,
            orchestrator_config,
            manager_config,
            WindowConfig::default(),
        ))
    }

    /// The job orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    /// The deployment manager.
    #[must_use]
    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// The offline queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Whether submissions go straight to providers.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Override connectivity, e.g. for a forced offline submission.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Start probing connectivity; the queue drains on reconnect.
    #[must_use]
    pub fn watch_connectivity(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> ConnectivityMonitor {
        ConnectivityMonitor::spawn(
            probe,
            self.queue.clone(),
            Arc::new(self.orchestrator.clone()),
            self.online.clone(),
            interval,
        )
    }

    /// Re-attach to live jobs and deployments. Returns `(jobs, deployments)`.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn resume(&self) -> Result<(usize, usize)> {
        let jobs = self.orchestrator.resume().await?;
        let deployments = self.deployments.resume().await?;
        info!(jobs, deployments, "Resumed live work");
        Ok((jobs, deployments))
    }

    /// Authenticate a provider.
    ///
    /// # Errors
    /// Returns `UnknownProvider`, a credential error or the connector error.
    pub async fn connect(
        &self,
        provider: &str,
        credentials: &dyn CredentialStore,
    ) -> Result<ConnectionHandle> {
        self.registry.connect(provider, credentials).await
    }

    /// Provider catalog.
    ///
    /// # Errors
    /// Returns `UnknownProvider` or the connector error.
    pub async fn list_resources(&self, provider: &str) -> Result<Vec<Resource>> {
        Ok(self.registry.jobs(provider)?.list_resources().await?)
    }

    /// Price of one resource.
    ///
    /// # Errors
    /// Returns `UnknownProvider` or the connector error.
    pub async fn get_pricing(&self, provider: &str, resource_id: &str) -> Result<PricingInfo> {
        Ok(self.registry.jobs(provider)?.get_pricing(resource_id).await?)
    }

    /// Submit now when online, otherwise queue.
    ///
    /// # Errors
    /// Returns `Validation`, `UnknownProvider` or a store/queue error.
    pub async fn submit(
        &self,
        provider: &str,
        config: JobConfig,
        idempotency_key: Option<String>,
    ) -> Result<SubmitOutcome> {
        if self.is_online() {
            let job = self.orchestrator.submit(provider, config, idempotency_key).await?;
            return Ok(SubmitOutcome::Submitted(job));
        }

        self.registry.jobs(provider)?;
        let entry = match idempotency_key {
            Some(key) => self.queue.enqueue_with_key(provider, config, key).await?,
            None => self.queue.enqueue(provider, config).await?,
        };
        Ok(SubmitOutcome::Queued(entry))
    }

    /// Jobs filtered by status (all when empty).
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn list_jobs(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        self.orchestrator.list(statuses).await
    }

    /// One job.
    ///
    /// # Errors
    /// Returns `JobNotFound` or a store error.
    pub async fn job_status(&self, id: &JobId) -> Result<Job> {
        self.orchestrator.status(id).await
    }

    /// Cancel a job.
    ///
    /// # Errors
    /// See [`JobOrchestrator::cancel`].
    pub async fn cancel_job(&self, id: &JobId) -> Result<Job> {
        self.orchestrator.cancel(id).await
    }

    /// Stream a job's log.
    ///
    /// # Errors
    /// See [`JobOrchestrator::stream_logs`].
    pub async fn stream_logs(
        &self,
        id: &JobId,
        from_offset: u64,
    ) -> Result<BoxStream<'static, Result<LogLine, ConnectorError>>> {
        self.orchestrator.stream_logs(id, from_offset).await
    }

    /// A completed job's artifact.
    ///
    /// # Errors
    /// See [`JobOrchestrator::fetch_artifact`].
    pub async fn fetch_artifact(&self, id: &JobId) -> Result<Vec<u8>> {
        self.orchestrator.fetch_artifact(id).await
    }

    /// Queued submissions in FIFO order.
    pub async fn queued(&self) -> Vec<QueuedSubmission> {
        self.queue.pending().await
    }

    /// Drain the offline queue now.
    ///
    /// # Errors
    /// See [`OfflineQueue::drain`].
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        self.queue.drain(&self.orchestrator).await
    }

    /// Start a deployment.
    ///
    /// # Errors
    /// See [`DeploymentManager::deploy`].
    pub async fn deploy(&self, platform: &str, config: DeploymentConfig) -> Result<Deployment> {
        self.deployments.deploy(platform, config).await
    }

    /// Change a deployment's scaling.
    ///
    /// # Errors
    /// See [`DeploymentManager::update_scaling`].
    pub async fn scale(&self, id: &DeploymentId, scaling: ScalingConfig) -> Result<Deployment> {
        self.deployments.update_scaling(id, scaling).await
    }

    /// Stop a deployment.
    ///
    /// # Errors
    /// See [`DeploymentManager::stop`].
    pub async fn stop_deployment(&self, id: &DeploymentId) -> Result<Deployment> {
        self.deployments.stop(id).await
    }

    /// Deployments filtered by status (all when empty).
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn list_deployments(&self, statuses: &[DeploymentStatus]) -> Result<Vec<Deployment>> {
        self.deployments.list(statuses).await
    }

    /// One deployment.
    ///
    /// # Errors
    /// Returns `DeploymentNotFound` or a store error.
    pub async fn deployment_status(&self, id: &DeploymentId) -> Result<Deployment> {
        self.deployments.status(id).await
    }

    /// Endpoints currently serving.
    #[must_use]
    pub fn active_endpoints(&self) -> Vec<ActiveEndpoint> {
        self.deployments.active()
    }

    /// Ingest request samples.
    ///
    /// # Errors
    /// See [`DeploymentManager::record_samples`].
    pub async fn record_samples(&self, id: &DeploymentId, samples: &[MetricSample]) -> Result<usize> {
        self.deployments.record_samples(id, samples).await
    }

    /// Rolling metrics of a deployment.
    ///
    /// # Errors
    /// See [`DeploymentManager::metrics`].
    pub async fn get_metrics(&self, id: &DeploymentId) -> Result<MetricsReport> {
        self.deployments.metrics(id).await
    }

    /// Stop background tasks; live work resumes on the next `resume`.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.deployments.shutdown().await;
    }
}
