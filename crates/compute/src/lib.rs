//! Multi-provider training job and inference deployment orchestration.
//!
//! This crate submits fine-tuning jobs and serving endpoints to external GPU
//! providers, tracks them through one state machine per entity, retries
//! what can be retried, buffers submissions while offline, and aggregates
//! per-request serving metrics.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ComputeService                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │   OfflineQueue ──drain──► JobOrchestrator   DeploymentManager│
//! │        ▲                        │                  │    │    │
//! │  ConnectivityMonitor            ▼                  ▼    ▼    │
//! │                          ConnectorRegistry   MetricsAggregator│
//! │                     ┌───────────┼───────────┐                │
//! │                     ▼           ▼           ▼                │
//! │                  polling     session    serverless           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connector Variants
//!
//! - **Polling** - REST API, submit then poll job status
//! - **Session** - rent a VM, drive the run over SSH, tail the log file
//! - **Serverless** - invoke a managed function, provider scales workers
//! - **Mock** - scripted in-process provider for tests and dry runs
//!
//! ## Example
//!
//! ```ignore
//! use compute::{ComputeService, JobConfig, SubmitOutcome};
//!
//! let service = ComputeService::from_settings(&settings, orchestrator_cfg, manager_cfg).await?;
//! service.resume().await?;
//!
//! let config = JobConfig::new("ft-llama", "gpu_1x_a100", "llama-3-8b", "s3://data/train.jsonl")
//!     .with_fallback("gpu_1x_h100");
//! if let SubmitOutcome::Submitted(job) = service.submit("lambda", config, None).await? {
//!     let done = service.orchestrator().wait_for_terminal(&job.id, timeout).await?;
//!     let weights = service.fetch_artifact(&done.id).await?;
//! }
//! ```

pub mod config;
pub mod connectors;
pub mod credentials;
pub mod deployment;
pub mod error;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod service;
pub mod store;

pub use config::{
    ConnectorKind, ExhaustionPolicy, ManagerConfig, OrchestratorConfig, ProviderSettings,
    RetryPolicy, Settings, WindowConfig,
};
pub use connectors::{Connector, ConnectorRegistry, MockConnector, ServingConnector};
pub use credentials::{CredentialStore, EnvCredentialStore, MemoryCredentialStore, SecretBundle};
pub use deployment::{ActiveEndpoint, DeploymentEvent, DeploymentManager};
pub use error::{ConnectorError, ErrorKind, OrchestratorError, Result};
pub use metrics::{MetricsAggregator, MetricsReport, MetricsSummary};
pub use models::{
    Deployment, DeploymentConfig, DeploymentId, DeploymentStatus, Job, JobConfig, JobId,
    JobStatus, LogLine, MetricSample, Resource, ScalingConfig,
};
pub use orchestrator::{JobEvent, JobOrchestrator};
pub use queue::{DrainReport, OfflineQueue, QueuedSubmission};
pub use service::{ComputeService, SubmitOutcome};
pub use store::{FileStore, MemoryStore, Store};
