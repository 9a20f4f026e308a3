//! Polling job API client implementation.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::models::{
    AccountResource, ApiResponse, CancelResource, CreateEndpointBody, CreateJobBody,
    EndpointResource, InstanceTypeResource, JobResource, LogsResource, PricingResource,
    ScalingBody, UpdateEndpointBody,
};
use crate::connectors::http::{encode_query, ApiClient};
use crate::connectors::parse_timestamp;
use crate::connectors::traits::{Connector, ServingConnector};
use crate::credentials::SecretBundle;
use crate::error::ConnectorError;
use crate::models::{
    Availability, ConnectionHandle, DeploymentConfig, JobConfig, LogLine, LogPage, PricingInfo,
    RemoteDeploymentStatus, RemoteJobStatus, Resource, ScalingConfig, UpdateOutcome,
};

/// Provider with a request/response API: submit, then poll.
#[derive(Debug)]
pub struct PollingConnector {
    name: String,
    api: ApiClient,
}

impl PollingConnector {
    /// Create a connector for the API at `base_url`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: name.into(),
            api: ApiClient::new(base_url)?,
        })
    }

    fn to_resource(&self, item: &InstanceTypeResource) -> Resource {
        Resource {
            provider: self.name.clone(),
            resource_id: item.id.clone(),
            gpu_type: item.gpu.model.clone(),
            vram_gb: item.gpu.memory_gb * item.gpu.count,
            hourly_rate: item.price_per_hour,
            availability: item
                .availability
                .as_deref()
                .map_or(Availability::Unknown, Availability::from_label),
        }
    }

    fn to_remote_status(job: &JobResource) -> RemoteJobStatus {
        match job.status.as_str() {
            "queued" | "pending" => RemoteJobStatus::Queued,
            "provisioning" | "booting" => RemoteJobStatus::Provisioning,
            "running" => RemoteJobStatus::Running,
            "succeeded" | "completed" => RemoteJobStatus::Succeeded,
            "cancelled" | "canceled" => RemoteJobStatus::Cancelled,
            other => RemoteJobStatus::Failed(
                job.error
                    .clone()
                    .unwrap_or_else(|| format!("provider reported status `{other}`")),
            ),
        }
    }

    fn to_remote_deployment(endpoint: &EndpointResource) -> RemoteDeploymentStatus {
        match (endpoint.status.as_str(), endpoint.url.as_deref()) {
            ("ready", Some(url)) if !url.is_empty() => RemoteDeploymentStatus::Ready {
                endpoint_url: url.to_string(),
            },
            ("stopped" | "deleted", _) => RemoteDeploymentStatus::Stopped,
            ("failed", _) => RemoteDeploymentStatus::Failed {
                message: endpoint
                    .error
                    .clone()
                    .unwrap_or_else(|| "endpoint failed".to_string()),
            },
            _ => RemoteDeploymentStatus::Deploying,
        }
    }

    fn scaling_body(scaling: &ScalingConfig) -> ScalingBody {
        ScalingBody {
            min_replicas: scaling.min_replicas,
            max_replicas: scaling.max_replicas,
            target_concurrency: scaling.target_concurrency,
        }
    }
}

#[async_trait]
impl Connector for PollingConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        credentials: &SecretBundle,
    ) -> Result<ConnectionHandle, ConnectorError> {
        self.api.set_token(credentials.require("api_key")?);
        let account: ApiResponse<AccountResource> = self.api.get("/v1/account").await?;
        info!(provider = %self.name, account = %account.data.id, "Connected");

        Ok(ConnectionHandle {
            provider: self.name.clone(),
            account: Some(account.data.name.unwrap_or(account.data.id)),
            connected_at: Utc::now(),
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, ConnectorError> {
        let response: ApiResponse<Vec<InstanceTypeResource>> =
            self.api.get("/v1/instance-types").await?;
        Ok(response.data.iter().map(|i| self.to_resource(i)).collect())
    }

    async fn get_pricing(&self, resource_id: &str) -> Result<PricingInfo, ConnectorError> {
        let response: ApiResponse<PricingResource> = self
            .api
            .get(&format!("/v1/instance-types/{resource_id}/pricing"))
            .await?;
        Ok(PricingInfo {
            resource_id: resource_id.to_string(),
            hourly_rate: response.data.hourly_rate,
            currency: response.data.currency,
            billing_increment_secs: response.data.billing_increment_secs,
        })
    }

    async fn submit_job(
        &self,
        config: &JobConfig,
        idempotency_key: &str,
    ) -> Result<String, ConnectorError> {
        info!(
            provider = %self.name,
            name = %config.name,
            resource_id = %config.resource_id,
            "Submitting job"
        );

        let body = CreateJobBody {
            name: &config.name,
            instance_type: &config.resource_id,
            base_model: &config.base_model,
            dataset_uri: &config.dataset_uri,
            image: config.image.as_deref(),
            hyperparameters: &config.hyperparameters,
            env: &config.env,
            idempotency_key,
        };
        let response: ApiResponse<JobResource> =
            self.api.post("/v1/jobs", &body, Some(idempotency_key)).await?;

        info!(provider = %self.name, remote_id = %response.data.id, "Job accepted");
        Ok(response.data.id)
    }

    async fn find_job(&self, idempotency_key: &str) -> Result<Option<String>, ConnectorError> {
        let response: ApiResponse<Vec<JobResource>> = self
            .api
            .get(&format!(
                "/v1/jobs?idempotency_key={}",
                encode_query(idempotency_key)
            ))
            .await?;
        Ok(response.data.into_iter().next().map(|j| j.id))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ConnectorError> {
        let response: ApiResponse<JobResource> =
            self.api.get(&format!("/v1/jobs/{job_id}")).await?;
        let status = Self::to_remote_status(&response.data);
        debug!(provider = %self.name, remote_id = %job_id, status = %status, "Polled job");
        Ok(status)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<bool, ConnectorError> {
        info!(provider = %self.name, remote_id = %job_id, "Cancelling job");
        let response: ApiResponse<CancelResource> = self
            .api
            .post(
                &format!("/v1/jobs/{job_id}/cancel"),
                &serde_json::json!({}),
                None,
            )
            .await?;
        Ok(response.data.acknowledged)
    }

    async fn read_logs(&self, job_id: &str, from_offset: u64) -> Result<LogPage, ConnectorError> {
        let response: ApiResponse<LogsResource> = self
            .api
            .get(&format!("/v1/jobs/{job_id}/logs?offset={from_offset}"))
            .await?;

        let mut cursor = from_offset;
        let lines = response
            .data
            .entries
            .into_iter()
            .map(|entry| {
                cursor += 1;
                LogLine {
                    next_offset: cursor,
                    timestamp: parse_timestamp(entry.timestamp.as_deref()),
                    message: entry.message,
                }
            })
            .collect();

        Ok(LogPage {
            lines,
            next_offset: response.data.next_offset.unwrap_or(cursor).max(cursor),
            finished: response.data.finished,
        })
    }

    async fn fetch_artifact(&self, job_id: &str) -> Result<Vec<u8>, ConnectorError> {
        let (status, body) = self
            .api
            .get_raw(&format!("/v1/jobs/{job_id}/artifact"))
            .await?;
        match status {
            202 | 409 | 425 => Err(ConnectorError::ArtifactNotReady(job_id.to_string())),
            200..=299 => Ok(body),
            404 | 410 => Err(ConnectorError::ArtifactNotFound(job_id.to_string())),
            _ => Err(ConnectorError::from_status(
                status,
                &String::from_utf8_lossy(&body),
            )),
        }
    }
}

#[async_trait]
impl ServingConnector for PollingConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn create_deployment(
        &self,
        config: &DeploymentConfig,
    ) -> Result<String, ConnectorError> {
        info!(provider = %self.name, name = %config.name, "Creating endpoint");
        let body = CreateEndpointBody {
            name: &config.name,
            model: &config.model_ref,
            instance_type: &config.resource_id,
            scaling: Self::scaling_body(&config.scaling),
        };
        let response: ApiResponse<EndpointResource> =
            self.api.post("/v1/endpoints", &body, None).await?;
        Ok(response.data.id)
    }

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> Result<RemoteDeploymentStatus, ConnectorError> {
        let response: ApiResponse<EndpointResource> = self
            .api
            .get(&format!("/v1/endpoints/{deployment_id}"))
            .await?;
        Ok(Self::to_remote_deployment(&response.data))
    }

    async fn update_config(
        &self,
        deployment_id: &str,
        scaling: &ScalingConfig,
    ) -> Result<UpdateOutcome, ConnectorError> {
        let body = UpdateEndpointBody {
            scaling: Self::scaling_body(scaling),
        };
        let _: ApiResponse<EndpointResource> = self
            .api
            .patch(&format!("/v1/endpoints/{deployment_id}"), &body)
            .await?;
        Ok(UpdateOutcome::Applied)
    }

    async fn health_check(&self, endpoint_url: &str) -> Result<bool, ConnectorError> {
        let url = format!("{}/health", endpoint_url.trim_end_matches('/'));
        let status = self.api.probe(&url).await?;
        Ok((200..300).contains(&status))
    }

    async fn stop_deployment(&self, deployment_id: &str) -> Result<bool, ConnectorError> {
        info!(provider = %self.name, remote_id = %deployment_id, "Deleting endpoint");
        self.api
            .delete(&format!("/v1/endpoints/{deployment_id}"))
            .await?;
        Ok(true)
    }
}
