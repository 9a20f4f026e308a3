//! Core records: jobs, deployments, catalog entries, log lines and metric
//! samples.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OrchestratorError, Result};

// ============================================================================
// Identifiers
// ============================================================================

/// Local identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create a job ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random job ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4()))
    }

    /// Borrow as `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Local identifier of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    /// Create a deployment ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random deployment ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("dep-{}", uuid::Uuid::new_v4()))
    }

    /// Borrow as `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeploymentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeploymentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Generate a client-side idempotency key.
#[must_use]
pub fn new_idempotency_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition<S> {
    /// State before the change.
    pub from: S,
    /// State after the change.
    pub to: S,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// One failed attempt that was retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// When the attempt failed.
    pub at: DateTime<Utc>,
    /// Operation that failed (`submit`, `status`, `artifact`, ...).
    pub operation: String,
    /// Error text.
    pub error: String,
}

// ============================================================================
// Jobs
// ============================================================================

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created locally, not yet accepted by the provider.
    Pending,
    /// Accepted by the provider, waiting for compute.
    Provisioning,
    /// Executing.
    Running,
    /// Finished with a confirmed artifact.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl JobStatus {
    /// Terminal states never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed edges of the job state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Provisioning | Self::Failed | Self::Cancelled)
                | (Self::Provisioning, Self::Running | Self::Failed | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }

    /// Non-terminal statuses.
    pub const ACTIVE: [Self; 3] = [Self::Pending, Self::Provisioning, Self::Running];
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Job state as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "message")]
pub enum RemoteJobStatus {
    /// Accepted, not yet scheduled.
    Queued,
    /// Machine or worker is being prepared.
    Provisioning,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed(String),
    /// Cancelled on the provider side.
    Cancelled,
}

impl std::fmt::Display for RemoteJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What to train and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Human-readable job name.
    pub name: String,
    /// Preferred resource (instance type / GPU plan).
    pub resource_id: String,
    /// Alternates tried in order when the preferred resource has no capacity.
    #[serde(default)]
    pub fallback_resource_ids: Vec<String>,
    /// Base model to fine-tune.
    pub base_model: String,
    /// Dataset location.
    pub dataset_uri: String,
    /// Container image or runtime identifier.
    #[serde(default)]
    pub image: Option<String>,
    /// Command run on the remote machine (session-provisioned providers).
    #[serde(default)]
    pub entrypoint: Option<String>,
    /// Training hyperparameters.
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
    /// Extra environment for the training process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobConfig {
    /// Create a minimal config.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        resource_id: impl Into<String>,
        base_model: impl Into<String>,
        dataset_uri: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resource_id: resource_id.into(),
            fallback_resource_ids: Vec::new(),
            base_model: base_model.into(),
            dataset_uri: dataset_uri.into(),
            image: None,
            entrypoint: None,
            hyperparameters: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    /// Add a fallback resource.
    #[must_use]
    pub fn with_fallback(mut self, resource_id: impl Into<String>) -> Self {
        self.fallback_resource_ids.push(resource_id.into());
        self
    }

    /// Set a hyperparameter.
    #[must_use]
    pub fn with_hyperparameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.hyperparameters.insert(key.into(), value.into());
        self
    }

    /// Preferred resource followed by fallbacks, without duplicates.
    #[must_use]
    pub fn candidate_resources(&self) -> Vec<String> {
        let mut out = vec![self.resource_id.clone()];
        for id in &self.fallback_resource_ids {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }

    /// Reject configs no provider could accept.
    ///
    /// # Errors
    /// Returns `Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("job name is empty".into()));
        }
        if self.resource_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("resource_id is empty".into()));
        }
        if self.base_model.trim().is_empty() {
            return Err(OrchestratorError::Validation("base_model is empty".into()));
        }
        if self.dataset_uri.trim().is_empty() {
            return Err(OrchestratorError::Validation("dataset_uri is empty".into()));
        }
        if self.fallback_resource_ids.iter().any(|r| r.trim().is_empty()) {
            return Err(OrchestratorError::Validation(
                "fallback resource id is empty".into(),
            ));
        }
        Ok(())
    }
}

/// A training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Local ID.
    pub id: JobId,
    /// Provider name (connector registry key).
    pub provider: String,
    /// Resource the job was accepted on (may differ from the config after fallback).
    pub resource_id: String,
    /// Submitted config.
    pub config: JobConfig,
    /// Current status.
    pub status: JobStatus,
    /// Provider-side job ID, once accepted.
    pub remote_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the job entered `Provisioning`.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the job entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Where the confirmed artifact lives.
    pub artifact_ref: Option<String>,
    /// Failure kind for failed or force-cancelled jobs.
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure description.
    pub error_message: Option<String>,
    /// Consecutive transient failures of the current operation, never above
    /// the retry policy's `max_retries`.
    pub retry_count: u32,
    /// Client-generated deduplication key.
    pub idempotency_key: String,
    /// Hourly rate times running hours.
    pub estimated_cost: Option<f64>,
    /// Every retried failure.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Every state change.
    #[serde(default)]
    pub history: Vec<Transition<JobStatus>>,
}

impl Job {
    /// Create a pending job.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        config: JobConfig,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            provider: provider.into(),
            resource_id: config.resource_id.clone(),
            config,
            status: JobStatus::Pending,
            remote_id: None,
            created_at: Utc::now(),
            submitted_at: None,
            started_at: None,
            completed_at: None,
            artifact_ref: None,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            idempotency_key: idempotency_key.into(),
            estimated_cost: None,
            attempts: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Move to `to`, recording the edge and timestamps.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for edges outside the state machine.
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        match to {
            JobStatus::Provisioning => self.submitted_at = Some(now),
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Pending => {}
        }
        self.history.push(Transition {
            from: self.status,
            to,
            at: now,
        });
        self.status = to;
        Ok(())
    }

    /// Move to `Failed` with a kind and message.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the job is already terminal.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Record a failed attempt in the history without touching
    /// `retry_count`.
    pub fn record_attempt(&mut self, operation: &str, error: &impl std::fmt::Display) {
        self.attempts.push(AttemptRecord {
            at: Utc::now(),
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }

    /// Record a transient failure counted against the retry budget.
    pub fn record_retry(&mut self, operation: &str, error: &impl std::fmt::Display, max_retries: u32) {
        self.record_attempt(operation, error);
        self.retry_count = (self.retry_count + 1).min(max_retries);
    }

    /// Hours spent in `Running` (up to now for running jobs).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn running_hours(&self) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        let end = self.completed_at.unwrap_or_else(Utc::now);
        let millis = (end - started).num_milliseconds().max(0);
        millis as f64 / 3_600_000.0
    }
}

// ============================================================================
// Deployments
// ============================================================================

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created locally.
    Pending,
    /// Provider is standing up the endpoint.
    Deploying,
    /// Serving traffic.
    Active,
    /// Failed to deploy or went unhealthy.
    Failed,
    /// Stopped by the user.
    Stopped,
}

impl DeploymentStatus {
    /// Terminal states never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Allowed edges of the deployment state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Deploying | Self::Failed | Self::Stopped)
                | (Self::Deploying, Self::Active | Self::Failed | Self::Stopped)
                | (Self::Active, Self::Failed | Self::Stopped)
        )
    }

    /// Non-terminal statuses.
    pub const LIVE: [Self; 3] = [Self::Pending, Self::Deploying, Self::Active];
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Deploying => write!(f, "deploying"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Deployment state as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDeploymentStatus {
    /// Still coming up.
    Deploying,
    /// Serving at the given URL.
    Ready { endpoint_url: String },
    /// Provider gave up.
    Failed { message: String },
    /// Torn down on the provider side.
    Stopped,
}

/// Replica and concurrency settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Minimum replicas (0 allows scale to zero).
    pub min_replicas: u32,
    /// Maximum replicas.
    pub max_replicas: u32,
    /// Requests per replica before scaling out.
    pub target_concurrency: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 1,
            target_concurrency: 8,
        }
    }
}

impl ScalingConfig {
    /// Check bounds.
    ///
    /// # Errors
    /// Returns `Validation` for inverted or zero bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_replicas == 0 {
            return Err(OrchestratorError::Validation(
                "max_replicas must be at least 1".into(),
            ));
        }
        if self.min_replicas > self.max_replicas {
            return Err(OrchestratorError::Validation(format!(
                "min_replicas ({}) exceeds max_replicas ({})",
                self.min_replicas, self.max_replicas
            )));
        }
        if self.target_concurrency == 0 {
            return Err(OrchestratorError::Validation(
                "target_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// What to serve and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Endpoint name.
    pub name: String,
    /// Model or adapter reference (often a job artifact).
    pub model_ref: String,
    /// Resource to serve on.
    pub resource_id: String,
    /// Scaling settings.
    #[serde(default)]
    pub scaling: ScalingConfig,
}

impl DeploymentConfig {
    /// Reject configs no provider could accept.
    ///
    /// # Errors
    /// Returns `Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "deployment name is empty".into(),
            ));
        }
        if self.model_ref.trim().is_empty() {
            return Err(OrchestratorError::Validation("model_ref is empty".into()));
        }
        if self.resource_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("resource_id is empty".into()));
        }
        self.scaling.validate()
    }
}

/// Result of a scaling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied in place.
    Applied,
    /// Provider cannot change this in place; a replacement is needed.
    RequiresRedeploy,
}

/// A served inference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Local ID.
    pub id: DeploymentId,
    /// Provider name (connector registry key).
    pub platform: String,
    /// Submitted config; `config.scaling` is the applied scaling.
    pub config: DeploymentConfig,
    /// Current status.
    pub status: DeploymentStatus,
    /// Provider-side deployment ID.
    pub remote_id: Option<String>,
    /// Public URL; always set while `Active`.
    pub endpoint_url: Option<String>,
    /// Key of this deployment's rolling metrics window.
    pub metrics_ref: String,
    /// Consecutive failed health checks.
    pub health_failures: u32,
    /// Failure kind.
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure description.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
    /// Every state change.
    #[serde(default)]
    pub history: Vec<Transition<DeploymentStatus>>,
}

impl Deployment {
    /// Create a pending deployment.
    #[must_use]
    pub fn new(platform: impl Into<String>, config: DeploymentConfig) -> Self {
        let id = DeploymentId::generate();
        let now = Utc::now();
        Self {
            metrics_ref: id.to_string(),
            id,
            platform: platform.into(),
            config,
            status: DeploymentStatus::Pending,
            remote_id: None,
            endpoint_url: None,
            health_failures: 0,
            error_kind: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Move to `to`, recording the edge.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for disallowed edges, including `Active`
    /// without an endpoint URL.
    pub fn transition(&mut self, to: DeploymentStatus) -> Result<()> {
        let has_endpoint = self
            .endpoint_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if !self.status.can_transition_to(to) || (to == DeploymentStatus::Active && !has_endpoint)
        {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        self.history.push(Transition {
            from: self.status,
            to,
            at: now,
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `Failed` with a kind and message.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if already terminal.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Result<()> {
        self.transition(DeploymentStatus::Failed)?;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Provider-reported stock level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Plenty of capacity.
    High,
    /// Some capacity.
    Medium,
    /// Little capacity.
    Low,
    /// No capacity.
    Unavailable,
    /// Provider did not say.
    #[serde(other)]
    Unknown,
}

impl Availability {
    /// Parse a provider's free-form stock label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "high" | "available" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            "unavailable" | "none" | "out_of_stock" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A rentable compute shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Provider name.
    pub provider: String,
    /// Provider's resource identifier.
    pub resource_id: String,
    /// GPU model, e.g. "A100".
    pub gpu_type: String,
    /// GPU memory in GB.
    pub vram_gb: u32,
    /// Hourly price in USD.
    pub hourly_rate: f64,
    /// Stock level.
    pub availability: Availability,
}

/// Price of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingInfo {
    /// Provider's resource identifier.
    pub resource_id: String,
    /// Hourly price.
    pub hourly_rate: f64,
    /// ISO currency code.
    pub currency: String,
    /// Minimum billable increment in seconds.
    pub billing_increment_secs: u64,
}

/// Proof of a successful `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Provider name.
    pub provider: String,
    /// Account or project identity reported by the provider.
    pub account: Option<String>,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
}

// ============================================================================
// Logs
// ============================================================================

/// One line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Cursor to resume from to read the line after this one.
    pub next_offset: u64,
    /// Line text without trailing newline.
    pub message: String,
    /// Provider timestamp, when available.
    pub timestamp: Option<DateTime<Utc>>,
}

/// A batch of log lines returned by a connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    /// Lines in order.
    pub lines: Vec<LogLine>,
    /// Cursor after the last line (equals the request offset when empty).
    pub next_offset: u64,
    /// The job is terminal and no further lines will appear.
    pub finished: bool,
}

// ============================================================================
// Metrics
// ============================================================================

/// One served request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unique sample ID (deduplication key).
    pub sample_id: String,
    /// When the request completed.
    pub timestamp: DateTime<Utc>,
    /// End-to-end latency.
    pub latency_ms: f64,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Whether the request succeeded.
    pub success: bool,
    /// Cost in USD.
    pub cost: f64,
}

impl MetricSample {
    /// Reject negative or non-finite measurements.
    ///
    /// # Errors
    /// Returns `Validation` describing the bad field.
    pub fn validate(&self) -> Result<()> {
        if self.sample_id.is_empty() {
            return Err(OrchestratorError::Validation("sample_id is empty".into()));
        }
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(OrchestratorError::Validation(format!(
                "latency_ms must be non-negative, got {}",
                self.latency_ms
            )));
        }
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(OrchestratorError::Validation(format!(
                "cost must be non-negative, got {}",
                self.cost
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JobConfig {
        JobConfig::new("ft", "gpu_1x_a100", "llama-3-8b", "s3://data/train.jsonl")
    }

    #[test]
    fn test_job_edges() {
        use JobStatus::{Cancelled, Completed, Failed, Pending, Provisioning, Running};

        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Provisioning.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_job_transition_records_history() {
        let mut job = Job::new("mock", config(), "key-1");
        job.transition(JobStatus::Provisioning).unwrap();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.completed_at.is_some());

        let edges: Vec<_> = job.history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            edges,
            vec![
                (JobStatus::Pending, JobStatus::Provisioning),
                (JobStatus::Provisioning, JobStatus::Running),
                (JobStatus::Running, JobStatus::Completed),
            ]
        );
    }

    #[test]
    fn test_job_rejects_pending_to_completed() {
        let mut job = Job::new("mock", config(), "key-1");
        let err = job.transition(JobStatus::Completed).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.history.is_empty());
    }

    #[test]
    fn test_fail_on_terminal_keeps_original_error() {
        let mut job = Job::new("mock", config(), "key-1");
        job.fail(ErrorKind::Auth, "bad key").unwrap();
        assert!(job.fail(ErrorKind::Transient, "later").is_err());
        assert_eq!(job.error_kind, Some(ErrorKind::Auth));
        assert_eq!(job.error_message.as_deref(), Some("bad key"));
    }

    #[test]
    fn test_candidate_resources_dedup() {
        let cfg = config()
            .with_fallback("gpu_1x_h100")
            .with_fallback("gpu_1x_a100");
        assert_eq!(cfg.candidate_resources(), vec!["gpu_1x_a100", "gpu_1x_h100"]);
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let mut bad = config();
        bad.resource_id = "  ".into();
        assert!(matches!(
            bad.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_deployment_active_requires_endpoint() {
        let mut dep = Deployment::new(
            "mock",
            DeploymentConfig {
                name: "chat".into(),
                model_ref: "adapter-1".into(),
                resource_id: "gpu_1x_a10".into(),
                scaling: ScalingConfig::default(),
            },
        );
        dep.transition(DeploymentStatus::Deploying).unwrap();
        assert!(dep.transition(DeploymentStatus::Active).is_err());

        dep.endpoint_url = Some(String::new());
        assert!(dep.transition(DeploymentStatus::Active).is_err());

        dep.endpoint_url = Some("https://chat.example.com".into());
        dep.transition(DeploymentStatus::Active).unwrap();
        assert!(!dep.status.can_transition_to(DeploymentStatus::Deploying));
    }

    #[test]
    fn test_scaling_validation() {
        assert!(ScalingConfig::default().validate().is_ok());
        let inverted = ScalingConfig {
            min_replicas: 3,
            max_replicas: 2,
            target_concurrency: 1,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_metric_sample_validation() {
        let sample = MetricSample {
            sample_id: "s1".into(),
            timestamp: Utc::now(),
            latency_ms: -1.0,
            tokens_in: 1,
            tokens_out: 1,
            success: true,
            cost: 0.0,
        };
        assert!(sample.validate().is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("bogus".parse::<JobStatus>().is_err());
    }
}
