//! Serverless function API client implementation.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use tracing::{debug, info};

use super::models::{
    AccountResponse, CreateEndpointRequest, EndpointResponse, EndpointTemplate, GpuTypeResponse,
    RequestListResponse, RequestResponse, RunPolicy, RunRequest, StreamResponse, TrainingInput,
    UpdateEndpointRequest,
};
use crate::connectors::http::{encode_query, ApiClient};
use crate::connectors::traits::{Connector, ServingConnector};
use crate::credentials::SecretBundle;
use crate::error::ConnectorError;
use crate::models::{
    Availability, ConnectionHandle, DeploymentConfig, JobConfig, LogLine, LogPage, PricingInfo,
    RemoteDeploymentStatus, RemoteJobStatus, Resource, ScalingConfig, UpdateOutcome,
};

/// Workers are billed per second.
const BILLING_INCREMENT_SECS: u64 = 1;

/// Provider that runs training as a managed function and scales workers itself.
#[derive(Debug)]
pub struct ServerlessConnector {
    name: String,
    function: String,
    api: ApiClient,
}

impl ServerlessConnector {
    /// Create a connector invoking `function` on the API at `base_url`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        function: impl Into<String>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: name.into(),
            function: function.into(),
            api: ApiClient::new(base_url)?,
        })
    }

    fn function_path(&self, suffix: &str) -> String {
        format!("/v2/{}/{suffix}", self.function)
    }

    fn to_remote_status(request: &RequestResponse) -> RemoteJobStatus {
        match request.status.as_str() {
            "IN_QUEUE" => RemoteJobStatus::Queued,
            "IN_PROGRESS" => RemoteJobStatus::Running,
            "COMPLETED" => RemoteJobStatus::Succeeded,
            "CANCELLED" => RemoteJobStatus::Cancelled,
            "TIMED_OUT" => RemoteJobStatus::Failed("execution timed out".into()),
            other => RemoteJobStatus::Failed(
                request
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("request ended with status {other}")),
            ),
        }
    }

    fn is_terminal(status: &str) -> bool {
        matches!(status, "COMPLETED" | "FAILED" | "CANCELLED" | "TIMED_OUT")
    }

    fn hourly_rate(gpu: &GpuTypeResponse) -> f64 {
        gpu.price_per_second * 3600.0
    }

    async fn gpu_types(&self) -> Result<Vec<GpuTypeResponse>, ConnectorError> {
        self.api.get("/v2/gpu-types").await
    }
}

#[async_trait]
impl Connector for ServerlessConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        credentials: &SecretBundle,
    ) -> Result<ConnectionHandle, ConnectorError> {
        self.api.set_token(credentials.require("api_key")?);
        let account: AccountResponse = self.api.get("/v2/account").await?;
        info!(provider = %self.name, account = %account.id, function = %self.function, "Connected");

        Ok(ConnectionHandle {
            provider: self.name.clone(),
            account: Some(account.email.unwrap_or(account.id)),
            connected_at: Utc::now(),
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, ConnectorError> {
        Ok(self
            .gpu_types()
            .await?
            .iter()
            .map(|gpu| Resource {
                provider: self.name.clone(),
                resource_id: gpu.id.clone(),
                gpu_type: gpu.display_name.clone().unwrap_or_else(|| gpu.id.clone()),
                vram_gb: gpu.memory_gb,
                hourly_rate: Self::hourly_rate(gpu),
                availability: gpu
                    .stock_status
                    .as_deref()
                    .map_or(Availability::Unknown, Availability::from_label),
            })
            .collect())
    }

    async fn get_pricing(&self, resource_id: &str) -> Result<PricingInfo, ConnectorError> {
        let gpu = self
            .gpu_types()
            .await?
            .into_iter()
            .find(|g| g.id == resource_id)
            .ok_or_else(|| ConnectorError::NotFound(format!("GPU type {resource_id}")))?;
        Ok(PricingInfo {
            resource_id: resource_id.to_string(),
            hourly_rate: Self::hourly_rate(&gpu),
            currency: "USD".to_string(),
            billing_increment_secs: BILLING_INCREMENT_SECS,
        })
    }

    async fn submit_job(
        &self,
        config: &JobConfig,
        idempotency_key: &str,
    ) -> Result<String, ConnectorError> {
        info!(
            provider = %self.name,
            function = %self.function,
            gpu = %config.resource_id,
            "Invoking training function"
        );

        let body = RunRequest {
            input: TrainingInput {
                name: &config.name,
                base_model: &config.base_model,
                dataset_uri: &config.dataset_uri,
                hyperparameters: &config.hyperparameters,
                env: &config.env,
                idempotency_key,
            },
            policy: RunPolicy {
                gpu_type_ids: [config.resource_id.as_str()],
            },
        };
        let response: RequestResponse = self
            .api
            .post(&self.function_path("run"), &body, Some(idempotency_key))
            .await?;

        info!(provider = %self.name, request_id = %response.id, "Request queued");
        Ok(response.id)
    }

    async fn find_job(&self, idempotency_key: &str) -> Result<Option<String>, ConnectorError> {
        let response: RequestListResponse = self
            .api
            .get(&self.function_path(&format!(
                "requests?idempotency_key={}",
                encode_query(idempotency_key)
            )))
            .await?;
        Ok(response.requests.into_iter().next().map(|r| r.id))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ConnectorError> {
        let response: RequestResponse = self
            .api
            .get(&self.function_path(&format!("status/{job_id}")))
            .await?;
        let status = Self::to_remote_status(&response);
        debug!(provider = %self.name, request_id = %job_id, status = %status, "Polled request");
        Ok(status)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<bool, ConnectorError> {
        info!(provider = %self.name, request_id = %job_id, "Cancelling request");
        let response: RequestResponse = self
            .api
            .post(
                &self.function_path(&format!("cancel/{job_id}")),
                &serde_json::json!({}),
                None,
            )
            .await?;
        Ok(Self::is_terminal(&response.status))
    }

    async fn read_logs(&self, job_id: &str, from_offset: u64) -> Result<LogPage, ConnectorError> {
        let response: StreamResponse = self
            .api
            .get(&self.function_path(&format!("stream/{job_id}?offset={from_offset}")))
            .await?;

        let mut cursor = from_offset;
        let lines = response
            .stream
            .into_iter()
            .map(|chunk| {
                cursor += 1;
                LogLine {
                    next_offset: cursor,
                    message: chunk.output.trim_end_matches('\n').to_string(),
                    timestamp: None,
                }
            })
            .collect();

        Ok(LogPage {
            lines,
            next_offset: cursor,
            finished: Self::is_terminal(&response.status),
        })
    }

    async fn fetch_artifact(&self, job_id: &str) -> Result<Vec<u8>, ConnectorError> {
        let response: RequestResponse = self
            .api
            .get(&self.function_path(&format!("status/{job_id}")))
            .await?;

        match response.status.as_str() {
            "COMPLETED" => {}
            "IN_QUEUE" | "IN_PROGRESS" => {
                return Err(ConnectorError::ArtifactNotReady(job_id.to_string()))
            }
            _ => return Err(ConnectorError::ArtifactNotFound(job_id.to_string())),
        }

        let Some(output) = response.output else {
            return Err(ConnectorError::ArtifactNotFound(job_id.to_string()));
        };

        if let Some(inline) = output.artifact_base64 {
            return base64::engine::general_purpose::STANDARD
                .decode(inline.trim())
                .map_err(|e| ConnectorError::Validation(format!("corrupt inline artifact: {e}")));
        }

        let Some(url) = output.artifact_url else {
            return Err(ConnectorError::ArtifactNotFound(job_id.to_string()));
        };
        let (status, body) = self.api.get_absolute(&url).await?;
        match status {
            200..=299 => Ok(body),
            403 | 404 | 410 => Err(ConnectorError::ArtifactNotFound(job_id.to_string())),
            _ => Err(ConnectorError::from_status(
                status,
                &String::from_utf8_lossy(&body),
            )),
        }
    }
}

#[async_trait]
impl ServingConnector for ServerlessConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn create_deployment(
        &self,
        config: &DeploymentConfig,
    ) -> Result<String, ConnectorError> {
        info!(provider = %self.name, name = %config.name, "Creating serverless endpoint");
        let body = CreateEndpointRequest {
            name: &config.name,
            template: EndpointTemplate {
                model: &config.model_ref,
                gpu_type_ids: [config.resource_id.as_str()],
            },
            workers_min: config.scaling.min_replicas,
            workers_max: config.scaling.max_replicas,
            scaler_value: config.scaling.target_concurrency,
        };
        let response: EndpointResponse = self.api.post("/v2/endpoints", &body, None).await?;
        Ok(response.id)
    }

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> Result<RemoteDeploymentStatus, ConnectorError> {
        let response: EndpointResponse = self
            .api
            .get(&format!("/v2/endpoints/{deployment_id}"))
            .await?;

        Ok(match response.status.as_deref() {
            // Workers scale from zero on demand; the endpoint is usable once created.
            Some("READY" | "THROTTLED") => RemoteDeploymentStatus::Ready {
                endpoint_url: format!("{}/v2/{deployment_id}", self.api.base_url()),
            },
            Some("FAILED") => RemoteDeploymentStatus::Failed {
                message: response
                    .error
                    .unwrap_or_else(|| "endpoint failed".to_string()),
            },
            Some("DELETED") => RemoteDeploymentStatus::Stopped,
            _ => RemoteDeploymentStatus::Deploying,
        })
    }

    async fn update_config(
        &self,
        deployment_id: &str,
        scaling: &ScalingConfig,
    ) -> Result<UpdateOutcome, ConnectorError> {
        let body = UpdateEndpointRequest {
            workers_min: scaling.min_replicas,
            workers_max: scaling.max_replicas,
            scaler_value: scaling.target_concurrency,
        };
        let _: EndpointResponse = self
            .api
            .patch(&format!("/v2/endpoints/{deployment_id}"), &body)
            .await?;
        Ok(UpdateOutcome::Applied)
    }

    async fn health_check(&self, endpoint_url: &str) -> Result<bool, ConnectorError> {
        let url = format!("{}/health", endpoint_url.trim_end_matches('/'));
        let status = self.api.probe(&url).await?;
        Ok((200..300).contains(&status))
    }

    async fn stop_deployment(&self, deployment_id: &str) -> Result<bool, ConnectorError> {
        info!(provider = %self.name, endpoint = %deployment_id, "Deleting serverless endpoint");
        self.api
            .delete(&format!("/v2/endpoints/{deployment_id}"))
            .await?;
        Ok(true)
    }
}
