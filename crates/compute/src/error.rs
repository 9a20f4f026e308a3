//! Error taxonomy shared by connectors, the job orchestrator and the
//! deployment manager.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure kind persisted on terminal records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials rejected by the provider.
    Auth,
    /// Request rejected before or at submission.
    Validation,
    /// Provider had no capacity for the requested resource.
    Provisioning,
    /// Network or provider hiccup.
    Transient,
    /// Retries ran out.
    RetryExhausted,
    /// Job never left provisioning within the configured timeout.
    ProvisionTimeout,
    /// Artifact not yet available.
    ArtifactNotReady,
    /// Artifact missing after completion.
    ArtifactNotFound,
    /// Provider never acknowledged a cancel/stop request.
    CancelTimeout,
    /// Provider reported the job or deployment as failed.
    RemoteFailure,
    /// Endpoint failed repeated health checks.
    HealthCheck,
    /// Remote entity disappeared.
    NotFound,
}

impl ErrorKind {
    /// Whether errors of this kind are retried by the orchestrator.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Provisioning | Self::ArtifactNotReady
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Validation => write!(f, "validation"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Transient => write!(f, "transient"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::ProvisionTimeout => write!(f, "provision_timeout"),
            Self::ArtifactNotReady => write!(f, "artifact_not_ready"),
            Self::ArtifactNotFound => write!(f, "artifact_not_found"),
            Self::CancelTimeout => write!(f, "cancel_timeout"),
            Self::RemoteFailure => write!(f, "remote_failure"),
            Self::HealthCheck => write!(f, "health_check"),
            Self::NotFound => write!(f, "not_found"),
        }
    }
}

/// Errors returned by a provider connector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Missing or invalid credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Request rejected by the provider.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No capacity for the requested resource.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Retryable failure (timeouts, 5xx, rate limits, dropped connections).
    #[error("Transient error: {0}")]
    Transient(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Artifact exists but is not downloadable yet.
    #[error("Artifact not ready for job {0}")]
    ArtifactNotReady(String),

    /// Artifact does not exist.
    #[error("Artifact not found for job {0}")]
    ArtifactNotFound(String),

    /// The variant cannot perform this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl ConnectorError {
    /// Failure kind recorded when this error ends a job or deployment.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Validation(_) | Self::Unsupported(_) => ErrorKind::Validation,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::Transient(_) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ArtifactNotReady(_) => ErrorKind::ArtifactNotReady,
            Self::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
        }
    }

    /// Whether the orchestrator may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Map a non-success HTTP response onto the taxonomy.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };

        match status {
            401 | 403 => Self::Auth(message),
            404 => Self::NotFound(message),
            409 | 503 if is_capacity_message(body) => Self::Provisioning(message),
            408 | 425 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Validation(message),
        }
    }
}

/// Providers phrase capacity shortages differently; match the common ones.
fn is_capacity_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["capacity", "out of stock", "no instances available", "unavailable"]
        .iter()
        .any(|marker| lower.contains(marker))
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transient(format!("malformed provider response: {err}"))
    }
}

/// Errors surfaced by the orchestrator, deployment manager, queue and store.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A connector call failed.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// No connector registered under this provider name.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Job does not exist.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Deployment does not exist.
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    /// State machine edge not allowed.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Terminal records are read-only.
    #[error("Record {0} is archived and read-only")]
    Archived(String),

    /// Input rejected before reaching a provider.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A drain is already running.
    #[error("Offline queue drain already in progress")]
    DrainInProgress,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error from a durable store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error from a durable store.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timed out waiting for a state change.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result alias used throughout the crate.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
