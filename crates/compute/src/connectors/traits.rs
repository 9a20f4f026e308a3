//! Connector capability traits.

use async_trait::async_trait;

use crate::credentials::SecretBundle;
use crate::error::ConnectorError;
use crate::models::{
    ConnectionHandle, DeploymentConfig, JobConfig, LogPage, PricingInfo, RemoteDeploymentStatus,
    RemoteJobStatus, Resource, ScalingConfig, UpdateOutcome,
};

/// Training-job capabilities of one compute provider.
///
/// Every variant implements every operation; the orchestrator never looks
/// at which variant it is talking to.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry name of this provider.
    fn provider(&self) -> &str;

    /// Authenticate and keep the credentials for later calls.
    async fn connect(&self, credentials: &SecretBundle)
        -> Result<ConnectionHandle, ConnectorError>;

    /// Rentable resources, in provider order.
    async fn list_resources(&self) -> Result<Vec<Resource>, ConnectorError>;

    /// Price of a single resource.
    async fn get_pricing(&self, resource_id: &str) -> Result<PricingInfo, ConnectorError>;

    /// Submit a job and return the provider's job ID.
    async fn submit_job(
        &self,
        config: &JobConfig,
        idempotency_key: &str,
    ) -> Result<String, ConnectorError>;

    /// Provider job ID previously accepted under `idempotency_key`, if any.
    async fn find_job(&self, idempotency_key: &str) -> Result<Option<String>, ConnectorError>;

    /// Current remote state.
    async fn get_job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ConnectorError>;

    /// Ask the provider to stop the job; `true` when acknowledged.
    async fn cancel_job(&self, job_id: &str) -> Result<bool, ConnectorError>;

    /// Log lines starting at cursor `from_offset`.
    ///
    /// Returned lines never precede `from_offset`. An empty page with
    /// `finished == false` means no new output yet.
    async fn read_logs(&self, job_id: &str, from_offset: u64) -> Result<LogPage, ConnectorError>;

    /// Download the trained artifact.
    async fn fetch_artifact(&self, job_id: &str) -> Result<Vec<u8>, ConnectorError>;

    /// Free billable resources of a finished job.
    ///
    /// Called once after the job reaches a terminal state. Providers that
    /// tear down on their own keep the default no-op.
    async fn release_job(&self, _job_id: &str) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Inference-endpoint capabilities of one provider.
#[async_trait]
pub trait ServingConnector: Send + Sync {
    /// Registry name of this provider.
    fn provider(&self) -> &str;

    /// Start standing up an endpoint; returns the provider's deployment ID.
    async fn create_deployment(&self, config: &DeploymentConfig)
        -> Result<String, ConnectorError>;

    /// Current remote state.
    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> Result<RemoteDeploymentStatus, ConnectorError>;

    /// Apply scaling in place. Re-applying the same values is harmless.
    async fn update_config(
        &self,
        deployment_id: &str,
        scaling: &ScalingConfig,
    ) -> Result<UpdateOutcome, ConnectorError>;

    /// Probe a serving endpoint; `true` when healthy.
    async fn health_check(&self, endpoint_url: &str) -> Result<bool, ConnectorError>;

    /// Tear the endpoint down; `true` when acknowledged.
    async fn stop_deployment(&self, deployment_id: &str) -> Result<bool, ConnectorError>;
}
