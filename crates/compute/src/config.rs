//! Tunables for the orchestrator, deployment manager and CLI.
//!
//! Every struct has production defaults; `from_env()` overrides individual
//! values from `COMPUTE_*` variables and ignores unset or unparsable ones.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Exponential backoff for retryable failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive retries allowed before giving up.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(16)).unwrap_or(16);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether another retry is allowed after `attempts` retries.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

/// What to do with the remote resource when a job gives up on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Issue a best-effort remote cancel so nothing keeps billing.
    #[default]
    CancelRemote,
    /// Leave the remote job alone for manual reconciliation.
    LeaveRunning,
}

impl std::str::FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cancel_remote" | "cancel" => Ok(Self::CancelRemote),
            "leave_running" | "leave" => Ok(Self::LeaveRunning),
            other => Err(format!("unknown exhaustion policy: {other}")),
        }
    }
}

/// Job orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between status polls of an active job.
    pub poll_interval: Duration,
    /// Backoff for transient and provisioning failures.
    pub retry: RetryPolicy,
    /// Longest a job may stay in `Provisioning`.
    pub provisioning_timeout: Duration,
    /// How long to wait for the provider to acknowledge a cancel.
    pub cancel_grace_period: Duration,
    /// Timeout applied to every connector call.
    pub call_timeout: Duration,
    /// Connector calls in flight across all jobs.
    pub max_concurrency: usize,
    /// Artifact fetch attempts after the provider reports success.
    pub artifact_retries: u32,
    /// Submission attempts per resource before moving to the next fallback.
    pub provisioning_attempts_per_resource: u32,
    /// Remote cleanup on retry exhaustion or provisioning timeout.
    pub exhaustion_policy: ExhaustionPolicy,
    /// Where confirmed artifacts are written; `None` keeps them remote.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            provisioning_timeout: Duration::from_secs(30 * 60),
            cancel_grace_period: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            max_concurrency: 8,
            artifact_retries: 3,
            provisioning_attempts_per_resource: 3,
            exhaustion_policy: ExhaustionPolicy::CancelRemote,
            artifact_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load from environment variables on top of the defaults.
    ///
    /// # Optional Environment Variables
    /// - `COMPUTE_POLL_INTERVAL_SECS`
    /// - `COMPUTE_MAX_RETRIES`
    /// - `COMPUTE_BACKOFF_INITIAL_MS`, `COMPUTE_BACKOFF_MAX_SECS`
    /// - `COMPUTE_PROVISIONING_TIMEOUT_SECS`
    /// - `COMPUTE_CANCEL_GRACE_SECS`
    /// - `COMPUTE_CALL_TIMEOUT_SECS`
    /// - `COMPUTE_MAX_CONCURRENCY`
    /// - `COMPUTE_ARTIFACT_RETRIES`
    /// - `COMPUTE_EXHAUSTION_POLICY` (`cancel_remote` | `leave_running`)
    /// - `COMPUTE_ARTIFACT_DIR`
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_secs("COMPUTE_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.poll_interval),
            retry: RetryPolicy {
                max_retries: env_parse("COMPUTE_MAX_RETRIES")
                    .unwrap_or(defaults.retry.max_retries),
                initial_delay: env_parse("COMPUTE_BACKOFF_INITIAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.initial_delay),
                max_delay: env_secs("COMPUTE_BACKOFF_MAX_SECS")
                    .unwrap_or(defaults.retry.max_delay),
                multiplier: defaults.retry.multiplier,
            },
            provisioning_timeout: env_secs("COMPUTE_PROVISIONING_TIMEOUT_SECS")
                .unwrap_or(defaults.provisioning_timeout),
            cancel_grace_period: env_secs("COMPUTE_CANCEL_GRACE_SECS")
                .unwrap_or(defaults.cancel_grace_period),
            call_timeout: env_secs("COMPUTE_CALL_TIMEOUT_SECS").unwrap_or(defaults.call_timeout),
            max_concurrency: env_parse("COMPUTE_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency),
            artifact_retries: env_parse("COMPUTE_ARTIFACT_RETRIES")
                .unwrap_or(defaults.artifact_retries),
            provisioning_attempts_per_resource: defaults.provisioning_attempts_per_resource,
            exhaustion_policy: env_parse("COMPUTE_EXHAUSTION_POLICY")
                .unwrap_or(defaults.exhaustion_policy),
            artifact_dir: std::env::var("COMPUTE_ARTIFACT_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Deployment manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between status polls while deploying.
    pub poll_interval: Duration,
    /// Backoff for transient failures.
    pub retry: RetryPolicy,
    /// Longest a deployment may stay in `Deploying`.
    pub deploy_timeout: Duration,
    /// Interval between health checks of an active endpoint.
    pub health_check_interval: Duration,
    /// Consecutive failed health checks before the deployment fails.
    pub max_health_failures: u32,
    /// How long to wait for the provider to acknowledge a stop.
    pub stop_grace_period: Duration,
    /// Timeout applied to every connector call.
    pub call_timeout: Duration,
    /// Connector calls in flight across all deployments.
    pub max_concurrency: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            deploy_timeout: Duration::from_secs(20 * 60),
            health_check_interval: Duration::from_secs(30),
            max_health_failures: 3,
            stop_grace_period: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            max_concurrency: 8,
        }
    }
}

impl ManagerConfig {
    /// Load from environment variables on top of the defaults.
    ///
    /// # Optional Environment Variables
    /// - `COMPUTE_DEPLOY_POLL_INTERVAL_SECS`
    /// - `COMPUTE_DEPLOY_TIMEOUT_SECS`
    /// - `COMPUTE_HEALTH_INTERVAL_SECS`
    /// - `COMPUTE_MAX_HEALTH_FAILURES`
    /// - `COMPUTE_STOP_GRACE_SECS`
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_secs("COMPUTE_DEPLOY_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.poll_interval),
            deploy_timeout: env_secs("COMPUTE_DEPLOY_TIMEOUT_SECS")
                .unwrap_or(defaults.deploy_timeout),
            health_check_interval: env_secs("COMPUTE_HEALTH_INTERVAL_SECS")
                .unwrap_or(defaults.health_check_interval),
            max_health_failures: env_parse("COMPUTE_MAX_HEALTH_FAILURES")
                .unwrap_or(defaults.max_health_failures),
            stop_grace_period: env_secs("COMPUTE_STOP_GRACE_SECS")
                .unwrap_or(defaults.stop_grace_period),
            ..defaults
        }
    }
}

/// Rolling window bounds for the metrics aggregator.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Most samples kept per deployment.
    pub max_samples: usize,
    /// Oldest sample kept, relative to the newest one.
    pub max_age: Option<chrono::Duration>,
    /// Span used for throughput.
    pub throughput_window: chrono::Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_samples: 10_000,
            max_age: Some(chrono::Duration::hours(24)),
            throughput_window: chrono::Duration::minutes(1),
        }
    }
}

/// Kind of connector to instantiate for a provider entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// Request/response REST API with job polling.
    Polling,
    /// Machine provisioned over an API, driven over a remote shell.
    Session,
    /// Managed serverless function invocation.
    Serverless,
    /// In-process scripted connector.
    Mock,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::Session => write!(f, "session"),
            Self::Serverless => write!(f, "serverless"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// One configured provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Registry name (also the credential store key).
    pub name: String,
    /// Connector variant.
    pub kind: ConnectorKind,
    /// API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Function/endpoint name for serverless providers.
    #[serde(default)]
    pub function: Option<String>,
    /// Project or team scope for providers that need one.
    #[serde(default)]
    pub project: Option<String>,
    /// Remote user for session providers.
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Private key for session providers.
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
}

/// CLI settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory for the job/deployment store and the offline queue.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// URL probed to decide whether we are online.
    #[serde(default)]
    pub connectivity_probe_url: Option<String>,
    /// Configured providers.
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".compute")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            connectivity_probe_url: None,
            providers: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if two
    /// providers share a name.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse settings from YAML text.
    ///
    /// # Errors
    /// Returns `Config` for malformed YAML or duplicate provider names.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(content)
            .map_err(|e| OrchestratorError::Config(format!("invalid settings: {e}")))?;

        let mut names = std::collections::HashSet::new();
        for provider in &settings.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
        }
        Ok(settings)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(10));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_exhaustion_policy_parse() {
        assert_eq!(
            "leave_running".parse::<ExhaustionPolicy>().unwrap(),
            ExhaustionPolicy::LeaveRunning
        );
        assert_eq!(ExhaustionPolicy::default(), ExhaustionPolicy::CancelRemote);
        assert!("explode".parse::<ExhaustionPolicy>().is_err());
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r"
state_dir: /tmp/compute
providers:
  - name: lambda
    kind: polling
    base_url: https://cloud.example.com/api
  - name: runpod
    kind: serverless
    base_url: https://api.example.net
    function: trainer
";
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/compute"));
        assert_eq!(settings.providers.len(), 2);
        assert_eq!(settings.providers[1].kind, ConnectorKind::Serverless);
        assert_eq!(settings.providers[1].function.as_deref(), Some("trainer"));
    }

    #[test]
    fn test_settings_duplicate_provider() {
        let yaml = r"
providers:
  - name: a
    kind: mock
  - name: a
    kind: polling
";
        assert!(matches!(
            Settings::from_yaml(yaml),
            Err(OrchestratorError::Config(_))
        ));
    }
}
