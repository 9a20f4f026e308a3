//! Integration tests for the deployment manager and serving metrics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::{deployment_config, manager_config, registry, WAIT};
use compute::models::{RemoteDeploymentStatus, UpdateOutcome};
use compute::{
    ConnectorError, Deployment, DeploymentManager, DeploymentStatus, ErrorKind, FileStore,
    ManagerConfig, MemoryStore, MetricSample, MetricsAggregator, MetricsReport, MockConnector,
    OrchestratorError, ScalingConfig, Store, WindowConfig,
};

fn manager_with(mock: &MockConnector, store: Arc<dyn Store>, config: ManagerConfig) -> DeploymentManager {
    let metrics = Arc::new(MetricsAggregator::new(WindowConfig::default()));
    DeploymentManager::new(registry(mock), store, metrics, config)
}

fn manager(mock: &MockConnector) -> DeploymentManager {
    manager_with(mock, Arc::new(MemoryStore::new()), manager_config())
}

/// Mock whose endpoints come up after one `Deploying` poll.
fn ready_mock() -> MockConnector {
    let mock = MockConnector::new("mock");
    mock.script_deployment(vec![
        RemoteDeploymentStatus::Deploying,
        RemoteDeploymentStatus::Ready {
            endpoint_url: String::new(),
        },
    ]);
    mock
}

async fn deploy_active(manager: &DeploymentManager) -> Deployment {
    let deployment = manager.deploy("mock", deployment_config()).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Deploying);
    manager
        .wait_for_status(&deployment.id, &[DeploymentStatus::Active], WAIT)
        .await
        .unwrap()
}

fn sample(id: &str, second: u32, latency_ms: f64, success: bool) -> MetricSample {
    MetricSample {
        sample_id: id.to_string(),
        timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, second).unwrap(),
        latency_ms,
        tokens_in: 100,
        tokens_out: 40,
        success,
        cost: 0.002,
    }
}

fn assert_legal_history(deployment: &Deployment) {
    for edge in &deployment.history {
        assert!(edge.from.can_transition_to(edge.to));
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_deploy_becomes_active_with_endpoint() {
    let mock = ready_mock();
    let manager = manager(&mock);

    let active = deploy_active(&manager).await;

    let remote_id = active.remote_id.clone().unwrap();
    assert_eq!(
        active.endpoint_url.as_deref(),
        Some(format!("http://mock.local/{remote_id}").as_str())
    );
    assert_legal_history(&active);

    let endpoints = manager.active();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].id, active.id);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_remote_failure_while_deploying() {
    let mock = MockConnector::new("mock");
    mock.script_deployment(vec![
        RemoteDeploymentStatus::Deploying,
        RemoteDeploymentStatus::Failed {
            message: "image pull failed".into(),
        },
    ]);
    let manager = manager(&mock);

    let deployment = manager.deploy("mock", deployment_config()).await.unwrap();
    let failed = manager
        .wait_for_status(&deployment.id, &[DeploymentStatus::Failed], WAIT)
        .await
        .unwrap();

    assert_eq!(failed.error_kind, Some(ErrorKind::RemoteFailure));
    assert_eq!(failed.error_message.as_deref(), Some("image pull failed"));
    assert!(manager.active().is_empty());
}

#[tokio::test]
async fn test_deploy_timeout() {
    let mock = MockConnector::new("mock");
    let config = ManagerConfig {
        deploy_timeout: Duration::from_millis(50),
        ..manager_config()
    };
    let manager = manager_with(&mock, Arc::new(MemoryStore::new()), config);

    let deployment = manager.deploy("mock", deployment_config()).await.unwrap();
    let failed = manager
        .wait_for_status(&deployment.id, &[DeploymentStatus::Failed], WAIT)
        .await
        .unwrap();

    assert_eq!(failed.error_kind, Some(ErrorKind::ProvisionTimeout));
    assert_eq!(mock.stopped(), vec![failed.remote_id.unwrap()]);
}

#[tokio::test]
async fn test_create_retries_transient_errors() {
    let mock = ready_mock();
    mock.fail_deployments(vec![
        ConnectorError::Transient("502".into()),
        ConnectorError::Transient("502".into()),
    ]);
    let manager = manager(&mock);

    let active = deploy_active(&manager).await;
    assert_eq!(active.status, DeploymentStatus::Active);
    assert_eq!(mock.deployment_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_create_rejected_credentials_fail_immediately() {
    let mock = ready_mock();
    mock.fail_deployments(vec![ConnectorError::Auth("invalid API key".into())]);
    let manager = manager(&mock);

    let deployment = manager.deploy("mock", deployment_config()).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.error_kind, Some(ErrorKind::Auth));
    assert_eq!(mock.deployment_count(), 0);
}

#[tokio::test]
async fn test_create_exhausts_retries() {
    let mock = ready_mock();
    mock.fail_deployments(vec![ConnectorError::Transient("502".into()); 10]);
    let manager = manager(&mock);

    let deployment = manager.deploy("mock", deployment_config()).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.error_kind, Some(ErrorKind::RetryExhausted));
}

#[tokio::test]
async fn test_invalid_scaling_is_rejected() {
    let mock = ready_mock();
    let manager = manager(&mock);
    let mut config = deployment_config();
    config.scaling.min_replicas = 4;
    config.scaling.max_replicas = 2;

    let result = manager.deploy("mock", config).await;
    assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    assert_eq!(mock.deployment_count(), 0);
}

// =============================================================================
// Scaling
// =============================================================================

#[tokio::test]
async fn test_scaling_applied_in_place() {
    let mock = ready_mock();
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;
    let remote_id = active.remote_id.clone().unwrap();

    let scaling = ScalingConfig {
        min_replicas: 0,
        max_replicas: 4,
        target_concurrency: 16,
    };
    let scaled = manager.update_scaling(&active.id, scaling.clone()).await.unwrap();

    assert_eq!(scaled.config.scaling, scaling);
    assert_eq!(scaled.remote_id.as_deref(), Some(remote_id.as_str()));
    assert_eq!(mock.deployment_scaling(&remote_id), Some(scaling.clone()));
    assert_eq!(mock.deployment_count(), 1);

    // Same scaling again never reaches the provider.
    manager.update_scaling(&active.id, scaling).await.unwrap();
    assert_eq!(mock.update_calls().len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_scaling_redeploys_when_provider_requires_it() {
    let mock = ready_mock();
    mock.set_update_outcome(UpdateOutcome::RequiresRedeploy);
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;
    let old_remote = active.remote_id.clone().unwrap();

    let scaling = ScalingConfig {
        min_replicas: 2,
        max_replicas: 2,
        target_concurrency: 8,
    };
    let scaled = manager.update_scaling(&active.id, scaling.clone()).await.unwrap();

    let new_remote = scaled.remote_id.clone().unwrap();
    assert_ne!(new_remote, old_remote);
    assert_eq!(scaled.status, DeploymentStatus::Active);
    assert_eq!(scaled.id, active.id);
    assert_eq!(
        scaled.endpoint_url.as_deref(),
        Some(format!("http://mock.local/{new_remote}").as_str())
    );
    assert_eq!(mock.deployment_scaling(&new_remote), Some(scaling));
    assert_eq!(mock.stopped(), vec![old_remote]);
    assert_eq!(mock.deployment_count(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_scaling_requires_active_deployment() {
    let mock = MockConnector::new("mock");
    let manager = manager(&mock);
    let deploying = manager.deploy("mock", deployment_config()).await.unwrap();

    let result = manager
        .update_scaling(&deploying.id, ScalingConfig::default())
        .await;
    assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    assert!(mock.update_calls().is_empty());
    manager.shutdown().await;
}

// =============================================================================
// Health and stop
// =============================================================================

#[tokio::test]
async fn test_repeated_health_failures_fail_deployment() {
    let mock = ready_mock();
    mock.script_health(vec![true, false]);
    let manager = manager(&mock);

    let deployment = manager.deploy("mock", deployment_config()).await.unwrap();
    let failed = manager
        .wait_for_status(&deployment.id, &[DeploymentStatus::Failed], WAIT)
        .await
        .unwrap();

    assert_eq!(failed.error_kind, Some(ErrorKind::HealthCheck));
    assert_eq!(failed.health_failures, 3);
    assert_eq!(mock.stopped(), vec![failed.remote_id.clone().unwrap()]);
    assert!(manager.active().is_empty());
    assert_legal_history(&failed);
}

#[tokio::test]
async fn test_health_recovers_below_threshold() {
    let mock = ready_mock();
    mock.script_health(vec![false, false, true]);
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let current = manager.status(&active.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Active);
    assert_eq!(current.health_failures, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_stop_active_deployment() {
    let mock = ready_mock();
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;

    let stopped = manager.stop(&active.id).await.unwrap();

    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(stopped.error_kind.is_none());
    assert_eq!(mock.stopped(), vec![active.remote_id.unwrap()]);
    assert!(manager.active().is_empty());

    // Stopping again is a no-op.
    let again = manager.stop(&active.id).await.unwrap();
    assert_eq!(again.history.len(), stopped.history.len());
    assert_eq!(mock.stopped().len(), 1);
}

#[tokio::test]
async fn test_stop_without_ack_is_forced_locally() {
    let mock = ready_mock();
    mock.set_stop_ack(false);
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;

    let stopped = manager.stop(&active.id).await.unwrap();

    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert_eq!(stopped.error_kind, Some(ErrorKind::CancelTimeout));
    assert!(stopped
        .error_message
        .unwrap()
        .contains("marked stopped locally"));
}

// =============================================================================
// Metrics
// =============================================================================

#[tokio::test]
async fn test_metrics_no_data_then_stats() {
    let mock = ready_mock();
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;

    assert_eq!(manager.metrics(&active.id).await.unwrap(), MetricsReport::NoData);

    let samples: Vec<MetricSample> = (0..20)
        .map(|i| sample(&format!("req-{i}"), i, f64::from(i + 1) * 10.0, i % 10 != 0))
        .collect();
    assert_eq!(manager.record_samples(&active.id, &samples).await.unwrap(), 20);

    let report = manager.metrics(&active.id).await.unwrap();
    let summary = report.summary().unwrap();
    assert_eq!(summary.total_requests, 20);
    assert_eq!(summary.failed_requests, 2);
    assert!((summary.error_rate - 0.1).abs() < 1e-9);
    assert!((summary.p50_latency_ms - 100.0).abs() < 1e-9);
    assert!((summary.p95_latency_ms - 190.0).abs() < 1e-9);
    assert!(summary.p50_latency_ms <= summary.p95_latency_ms);
    assert!(summary.p95_latency_ms <= summary.p99_latency_ms);
    assert_eq!(summary.total_tokens_in, 2000);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_replayed_samples_do_not_change_metrics() {
    let mock = ready_mock();
    let store = Arc::new(MemoryStore::new());
    let manager = manager_with(&mock, store.clone(), manager_config());
    let active = deploy_active(&manager).await;

    let samples = vec![
        sample("a", 1, 120.0, true),
        sample("b", 2, 80.0, true),
        sample("c", 3, 300.0, false),
    ];
    manager.record_samples(&active.id, &samples).await.unwrap();
    let first = manager.metrics(&active.id).await.unwrap();

    let mut replay = samples.clone();
    replay.reverse();
    assert_eq!(manager.record_samples(&active.id, &replay).await.unwrap(), 0);
    assert_eq!(manager.metrics(&active.id).await.unwrap(), first);
    assert_eq!(store.load_samples(&active.id).await.unwrap().len(), 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_invalid_sample_batch_is_rejected() {
    let mock = ready_mock();
    let manager = manager(&mock);
    let active = deploy_active(&manager).await;

    let batch = vec![sample("ok", 1, 50.0, true), sample("bad", 2, -1.0, true)];
    let result = manager.record_samples(&active.id, &batch).await;

    assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    assert_eq!(manager.metrics(&active.id).await.unwrap(), MetricsReport::NoData);
    manager.shutdown().await;
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_resume_restores_registry_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let mock = ready_mock();

    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let first = manager_with(&mock, store, manager_config());
    let active = deploy_active(&first).await;
    first
        .record_samples(&active.id, &[sample("a", 1, 40.0, true), sample("b", 2, 60.0, true)])
        .await
        .unwrap();
    first.shutdown().await;

    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let second = manager_with(&mock, store, manager_config());
    assert!(second.active().is_empty());
    assert_eq!(second.resume().await.unwrap(), 1);

    let endpoints = second.active();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].id, active.id);
    let report = second.metrics(&active.id).await.unwrap();
    assert_eq!(report.summary().unwrap().total_requests, 2);
    second.shutdown().await;
}

#[tokio::test]
async fn test_resume_fails_deployment_that_never_reached_provider() {
    let mock = ready_mock();
    let store = Arc::new(MemoryStore::new());
    let pending = Deployment::new("mock", deployment_config());
    store.create_deployment(&pending).await.unwrap();
    let manager = manager_with(&mock, store, manager_config());

    assert_eq!(manager.resume().await.unwrap(), 0);
    let failed = manager.status(&pending.id).await.unwrap();

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::Transient));
    assert_eq!(mock.deployment_count(), 0);
}
