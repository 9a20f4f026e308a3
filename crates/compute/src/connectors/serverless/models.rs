//! Wire models of the serverless function API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Account returned by the identity endpoint.
#[derive(Debug, Deserialize)]
pub struct AccountResponse {
    /// Account ID.
    pub id: String,
    /// Account email.
    #[serde(default)]
    pub email: Option<String>,
}

/// GPU type offered to serverless workers.
#[derive(Debug, Deserialize)]
pub struct GpuTypeResponse {
    /// GPU type ID, e.g. `NVIDIA A100 80GB PCIe`.
    pub id: String,
    /// Short display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Memory in GB.
    #[serde(default)]
    pub memory_gb: u32,
    /// Price per worker-second.
    #[serde(default)]
    pub price_per_second: f64,
    /// `High`, `Medium`, `Low` or absent.
    #[serde(default)]
    pub stock_status: Option<String>,
}

/// Input handed to the training function.
#[derive(Debug, Serialize)]
pub struct TrainingInput<'a> {
    /// Job name.
    pub name: &'a str,
    /// Base model.
    pub base_model: &'a str,
    /// Dataset location.
    pub dataset_uri: &'a str,
    /// Hyperparameters.
    pub hyperparameters: &'a BTreeMap<String, serde_json::Value>,
    /// Environment.
    pub env: &'a BTreeMap<String, String>,
    /// Client idempotency key.
    pub idempotency_key: &'a str,
}

/// Execution policy of a run.
#[derive(Debug, Serialize)]
pub struct RunPolicy<'a> {
    /// GPU types the request may run on.
    pub gpu_type_ids: [&'a str; 1],
}

/// Request body of `/run`.
#[derive(Debug, Serialize)]
pub struct RunRequest<'a> {
    /// Function input.
    pub input: TrainingInput<'a>,
    /// Execution policy.
    pub policy: RunPolicy<'a>,
}

/// Request state as returned by `/run`, `/status` and `/cancel`.
#[derive(Debug, Deserialize)]
pub struct RequestResponse {
    /// Request ID.
    pub id: String,
    /// `IN_QUEUE`, `IN_PROGRESS`, `COMPLETED`, `FAILED`, `CANCELLED`, `TIMED_OUT`.
    pub status: String,
    /// Function output once completed.
    #[serde(default)]
    pub output: Option<TrainingOutput>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}

/// Output of the training function.
#[derive(Debug, Deserialize)]
pub struct TrainingOutput {
    /// Presigned download URL of the artifact.
    #[serde(default)]
    pub artifact_url: Option<String>,
    /// Inline artifact for small outputs.
    #[serde(default)]
    pub artifact_base64: Option<String>,
}

/// Result of a request lookup by idempotency key.
#[derive(Debug, Deserialize)]
pub struct RequestListResponse {
    /// Matching requests, newest first.
    #[serde(default)]
    pub requests: Vec<RequestResponse>,
}

/// Streamed output chunk.
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    /// Line text.
    pub output: String,
}

/// Response of `/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamResponse {
    /// Request status.
    pub status: String,
    /// Chunks starting at the requested offset.
    #[serde(default)]
    pub stream: Vec<StreamChunk>,
}

/// Inference template of an endpoint.
#[derive(Debug, Serialize)]
pub struct EndpointTemplate<'a> {
    /// Model to serve.
    pub model: &'a str,
    /// GPU types workers may use.
    pub gpu_type_ids: [&'a str; 1],
}

/// Request body for endpoint creation.
#[derive(Debug, Serialize)]
pub struct CreateEndpointRequest<'a> {
    /// Endpoint name.
    pub name: &'a str,
    /// Worker template.
    pub template: EndpointTemplate<'a>,
    /// Minimum workers.
    pub workers_min: u32,
    /// Maximum workers.
    pub workers_max: u32,
    /// Queue depth per worker that triggers scale-out.
    pub scaler_value: u32,
}

/// Request body for scaling updates.
#[derive(Debug, Serialize)]
pub struct UpdateEndpointRequest {
    /// Minimum workers.
    pub workers_min: u32,
    /// Maximum workers.
    pub workers_max: u32,
    /// Queue depth per worker that triggers scale-out.
    pub scaler_value: u32,
}

/// Endpoint resource.
#[derive(Debug, Deserialize)]
pub struct EndpointResponse {
    /// Endpoint ID.
    pub id: String,
    /// `INITIALIZING`, `READY`, `THROTTLED`, `FAILED`, `DELETED`.
    #[serde(default)]
    pub status: Option<String>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}
