//! Wire models of the polling job API.

use serde::{Deserialize, Serialize};

/// Response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Response data.
    pub data: T,
}

/// Account returned by the identity endpoint.
#[derive(Debug, Deserialize)]
pub struct AccountResource {
    /// Account ID.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
}

/// GPU description of an instance type.
#[derive(Debug, Deserialize)]
pub struct GpuDescription {
    /// GPU model.
    pub model: String,
    /// Memory per GPU in GB.
    pub memory_gb: u32,
    /// GPUs per instance.
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

/// Instance type from the catalog.
#[derive(Debug, Deserialize)]
pub struct InstanceTypeResource {
    /// Instance type ID, e.g. `gpu_1x_a100`.
    pub id: String,
    /// GPU details.
    pub gpu: GpuDescription,
    /// Hourly price in USD.
    pub price_per_hour: f64,
    /// Stock label.
    #[serde(default)]
    pub availability: Option<String>,
}

/// Pricing for one instance type.
#[derive(Debug, Deserialize)]
pub struct PricingResource {
    /// Hourly price.
    pub hourly_rate: f64,
    /// Currency code.
    #[serde(default = "usd")]
    pub currency: String,
    /// Billing increment.
    #[serde(default = "per_minute")]
    pub billing_increment_secs: u64,
}

fn usd() -> String {
    "USD".to_string()
}

fn per_minute() -> u64 {
    60
}

/// Request body for job submission.
#[derive(Debug, Serialize)]
pub struct CreateJobBody<'a> {
    /// Job name.
    pub name: &'a str,
    /// Instance type.
    pub instance_type: &'a str,
    /// Base model.
    pub base_model: &'a str,
    /// Dataset location.
    pub dataset_uri: &'a str,
    /// Container image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<&'a str>,
    /// Hyperparameters.
    pub hyperparameters: &'a std::collections::BTreeMap<String, serde_json::Value>,
    /// Environment.
    pub env: &'a std::collections::BTreeMap<String, String>,
    /// Client idempotency key, echoed back on lookups.
    pub idempotency_key: &'a str,
}

/// Job resource.
#[derive(Debug, Deserialize)]
pub struct JobResource {
    /// Provider job ID.
    pub id: String,
    /// `queued`, `provisioning`, `running`, `succeeded`, `failed`, `cancelled`.
    pub status: String,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}

/// Cancel acknowledgement.
#[derive(Debug, Deserialize)]
pub struct CancelResource {
    /// Whether the provider accepted the cancel.
    pub acknowledged: bool,
}

/// Log page.
#[derive(Debug, Deserialize)]
pub struct LogsResource {
    /// Lines starting at the requested offset.
    pub entries: Vec<LogEntry>,
    /// Cursor after the last entry.
    pub next_offset: Option<u64>,
    /// Whether the job is terminal and the log complete.
    #[serde(default)]
    pub finished: bool,
}

/// One log entry.
#[derive(Debug, Deserialize)]
pub struct LogEntry {
    /// Line text.
    pub message: String,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Scaling block shared by create and update requests.
#[derive(Debug, Serialize)]
pub struct ScalingBody {
    /// Minimum replicas.
    pub min_replicas: u32,
    /// Maximum replicas.
    pub max_replicas: u32,
    /// Target concurrency per replica.
    pub target_concurrency: u32,
}

/// Request body for endpoint creation.
#[derive(Debug, Serialize)]
pub struct CreateEndpointBody<'a> {
    /// Endpoint name.
    pub name: &'a str,
    /// Model reference.
    pub model: &'a str,
    /// Instance type.
    pub instance_type: &'a str,
    /// Scaling.
    pub scaling: ScalingBody,
}

/// Request body for scaling updates.
#[derive(Debug, Serialize)]
pub struct UpdateEndpointBody {
    /// New scaling.
    pub scaling: ScalingBody,
}

/// Endpoint resource.
#[derive(Debug, Deserialize)]
pub struct EndpointResource {
    /// Provider endpoint ID.
    pub id: String,
    /// `deploying`, `ready`, `failed`, `stopped`.
    pub status: String,
    /// Public URL once ready.
    #[serde(default)]
    pub url: Option<String>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}
