//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use compute::{
    ConnectorKind, ConnectorRegistry, DeploymentConfig, ExhaustionPolicy, JobConfig, JobId,
    JobOrchestrator, JobStatus, ManagerConfig, MemoryStore, MockConnector, OrchestratorConfig,
    RetryPolicy, ScalingConfig, Store,
};

/// Upper bound for any wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Backoff in milliseconds so retry paths finish quickly.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(10),
        retry: fast_retry(5),
        provisioning_timeout: Duration::from_secs(5),
        cancel_grace_period: Duration::from_millis(100),
        call_timeout: Duration::from_secs(1),
        max_concurrency: 4,
        artifact_retries: 3,
        provisioning_attempts_per_resource: 2,
        exhaustion_policy: ExhaustionPolicy::CancelRemote,
        artifact_dir: None,
    }
}

pub fn manager_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_millis(10),
        retry: fast_retry(3),
        deploy_timeout: Duration::from_secs(5),
        health_check_interval: Duration::from_millis(10),
        max_health_failures: 3,
        stop_grace_period: Duration::from_millis(100),
        call_timeout: Duration::from_secs(1),
        max_concurrency: 4,
    }
}

pub fn registry(mock: &MockConnector) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register("mock", ConnectorKind::Mock, Arc::new(mock.clone()));
    registry
}

pub fn job_config() -> JobConfig {
    JobConfig::new(
        "ft-llama",
        "gpu_1x_a100",
        "llama-3-8b",
        "s3://datasets/train.jsonl",
    )
}

pub fn deployment_config() -> DeploymentConfig {
    DeploymentConfig {
        name: "llama-chat".into(),
        model_ref: "mock://mock-job-1".into(),
        resource_id: "gpu_1x_a10".into(),
        scaling: ScalingConfig::default(),
    }
}

pub fn orchestrator(mock: &MockConnector, config: OrchestratorConfig) -> (JobOrchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = JobOrchestrator::new(registry(mock), store.clone() as Arc<dyn Store>, config);
    (orchestrator, store)
}

/// Poll the store until the job reaches `status` or the wait runs out.
pub async fn wait_for_status(orchestrator: &JobOrchestrator, id: &JobId, status: JobStatus) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Ok(job) = orchestrator.status(id).await {
            if job.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
