//! HTTP connectors against a local mock provider API.

mod common;

use std::sync::Arc;

use base64::Engine as _;
use common::{deployment_config, job_config, manager_config, orchestrator_config, WAIT};
use compute::connectors::polling::PollingConnector;
use compute::connectors::serverless::ServerlessConnector;
use compute::models::{RemoteDeploymentStatus, RemoteJobStatus};
use compute::{
    Connector, ConnectorError, ConnectorKind, ConnectorRegistry, DeploymentManager,
    DeploymentStatus, ErrorKind, JobOrchestrator, JobStatus, MemoryStore, MetricsAggregator,
    SecretBundle, ServingConnector, WindowConfig,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn secrets() -> SecretBundle {
    SecretBundle::new().with("api_key", "test-key")
}

async fn mount_json(server: &MockServer, verb: &str, route: &str, status: u16, body: serde_json::Value) {
    Mock::given(method(verb))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

// =============================================================================
// Polling connector
// =============================================================================

#[tokio::test]
async fn test_polling_connect_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"id": "acct-1", "name": "research"}})),
        )
        .mount(&server)
        .await;

    let connector = PollingConnector::new("lambda", server.uri()).unwrap();
    let handle = connector.connect(&secrets()).await.unwrap();

    assert_eq!(handle.provider, "lambda");
    assert_eq!(handle.account.as_deref(), Some("research"));
}

#[tokio::test]
async fn test_polling_rejected_key_is_auth_error() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 401, json!({"error": "bad key"})).await;

    let connector = PollingConnector::new("lambda", server.uri()).unwrap();
    let err = connector.connect(&secrets()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn test_polling_catalog_and_pricing() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    mount_json(
        &server,
        "GET",
        "/v1/instance-types",
        200,
        json!({"data": [
            {"id": "gpu_8x_h100", "gpu": {"model": "H100", "memory_gb": 80, "count": 8},
             "price_per_hour": 23.92, "availability": "low"},
            {"id": "gpu_1x_a100", "gpu": {"model": "A100", "memory_gb": 40},
             "price_per_hour": 1.29}
        ]}),
    )
    .await;
    mount_json(
        &server,
        "GET",
        "/v1/instance-types/gpu_1x_a100/pricing",
        200,
        json!({"data": {"hourly_rate": 1.29}}),
    )
    .await;

    let connector = PollingConnector::new("lambda", server.uri()).unwrap();
    connector.connect(&secrets()).await.unwrap();

    let resources = connector.list_resources().await.unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].vram_gb, 640);
    assert_eq!(resources[1].vram_gb, 40);

    let pricing = connector.get_pricing("gpu_1x_a100").await.unwrap();
    assert!((pricing.hourly_rate - 1.29).abs() < 1e-9);
    assert_eq!(pricing.currency, "USD");
    assert_eq!(pricing.billing_increment_secs, 60);
}

#[tokio::test]
async fn test_polling_job_runs_to_completion_through_orchestrator() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/jobs"))
        .and(header("idempotency-key", "key-http-1"))
        .and(body_partial_json(json!({"instance_type": "gpu_1x_a100"})))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"data": {"id": "job-42", "status": "queued"}})),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_json(
        &server,
        "GET",
        "/v1/jobs/job-42",
        200,
        json!({"data": {"id": "job-42", "status": "succeeded"}}),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job-42/artifact"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"safetensors".to_vec()))
        .mount(&server)
        .await;
    mount_json(
        &server,
        "GET",
        "/v1/instance-types/gpu_1x_a100/pricing",
        200,
        json!({"data": {"hourly_rate": 1.29}}),
    )
    .await;

    let connector = Arc::new(PollingConnector::new("lambda", server.uri()).unwrap());
    connector.connect(&secrets()).await.unwrap();
    let mut registry = ConnectorRegistry::new();
    registry.register("lambda", ConnectorKind::Polling, connector);
    let orchestrator = JobOrchestrator::new(registry, Arc::new(MemoryStore::new()), orchestrator_config());

    let job = orchestrator
        .submit("lambda", job_config(), Some("key-http-1".into()))
        .await
        .unwrap();
    assert_eq!(job.remote_id.as_deref(), Some("job-42"));

    let done = orchestrator.wait_for_terminal(&job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.estimated_cost.is_some());
    assert_eq!(orchestrator.fetch_artifact(&job.id).await.unwrap(), b"safetensors");
}

#[tokio::test]
async fn test_polling_accepted_artifact_never_completes_job() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    mount_json(&server, "GET", "/v1/jobs", 200, json!({"data": []})).await;
    mount_json(
        &server,
        "POST",
        "/v1/jobs",
        201,
        json!({"data": {"id": "job-42", "status": "queued"}}),
    )
    .await;
    mount_json(
        &server,
        "GET",
        "/v1/jobs/job-42",
        200,
        json!({"data": {"id": "job-42", "status": "succeeded"}}),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job-42/artifact"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let connector = Arc::new(PollingConnector::new("lambda", server.uri()).unwrap());
    connector.connect(&secrets()).await.unwrap();
    assert!(matches!(
        connector.fetch_artifact("job-42").await,
        Err(ConnectorError::ArtifactNotReady(_))
    ));

    let mut registry = ConnectorRegistry::new();
    registry.register("lambda", ConnectorKind::Polling, connector);
    let orchestrator = JobOrchestrator::new(registry, Arc::new(MemoryStore::new()), orchestrator_config());

    let job = orchestrator.submit("lambda", job_config(), None).await.unwrap();
    let done = orchestrator.wait_for_terminal(&job.id, WAIT).await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error_kind, Some(ErrorKind::ArtifactNotFound));
    assert!(done.artifact_ref.is_none());
    assert!(orchestrator.fetch_artifact(&job.id).await.is_err());
}

#[tokio::test]
async fn test_polling_capacity_error_fails_with_provisioning() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    Mock::given(method("POST"))
        .and(path("/v1/jobs"))
        .respond_with(
            ResponseTemplate::new(503).set_body_string("Not enough capacity to fulfill launch request"),
        )
        .mount(&server)
        .await;

    let connector = Arc::new(PollingConnector::new("lambda", server.uri()).unwrap());
    connector.connect(&secrets()).await.unwrap();
    let mut registry = ConnectorRegistry::new();
    registry.register("lambda", ConnectorKind::Polling, connector);
    let orchestrator = JobOrchestrator::new(registry, Arc::new(MemoryStore::new()), orchestrator_config());

    let job = orchestrator.submit("lambda", job_config(), None).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::Provisioning));
    let posts = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.to_string() == "POST")
        .count();
    assert_eq!(posts, 2);
}

#[tokio::test]
async fn test_polling_find_job_by_key() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs"))
        .and(query_param("idempotency_key", "key 7"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"id": "job-7", "status": "running"}]})),
        )
        .mount(&server)
        .await;

    let connector = PollingConnector::new("lambda", server.uri()).unwrap();
    connector.connect(&secrets()).await.unwrap();

    assert_eq!(connector.find_job("key 7").await.unwrap().as_deref(), Some("job-7"));
}

#[tokio::test]
async fn test_polling_log_pages_and_artifact_states() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job-1/logs"))
        .and(query_param("offset", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {
            "entries": [
                {"message": "step 4", "timestamp": "2026-03-01T12:00:00Z"},
                {"message": "step 5"}
            ],
            "next_offset": 5,
            "finished": true
        }})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job-1/artifact"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job-2/artifact"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let connector = PollingConnector::new("lambda", server.uri()).unwrap();
    connector.connect(&secrets()).await.unwrap();

    let page = connector.read_logs("job-1", 3).await.unwrap();
    assert_eq!(page.lines.len(), 2);
    assert_eq!(page.lines[0].next_offset, 4);
    assert!(page.lines[0].timestamp.is_some());
    assert_eq!(page.next_offset, 5);
    assert!(page.finished);

    assert!(matches!(
        connector.fetch_artifact("job-1").await,
        Err(ConnectorError::ArtifactNotReady(_))
    ));
    assert!(matches!(
        connector.fetch_artifact("job-2").await,
        Err(ConnectorError::ArtifactNotFound(_))
    ));
}

#[tokio::test]
async fn test_polling_status_mapping() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v1/account", 200, json!({"data": {"id": "acct-1"}})).await;
    mount_json(
        &server,
        "GET",
        "/v1/jobs/job-f",
        200,
        json!({"data": {"id": "job-f", "status": "failed", "error": "NCCL timeout"}}),
    )
    .await;
    mount_json(
        &server,
        "GET",
        "/v1/jobs/job-b",
        200,
        json!({"data": {"id": "job-b", "status": "booting"}}),
    )
    .await;

    let connector = PollingConnector::new("lambda", server.uri()).unwrap();
    connector.connect(&secrets()).await.unwrap();

    assert_eq!(
        connector.get_job_status("job-f").await.unwrap(),
        RemoteJobStatus::Failed("NCCL timeout".into())
    );
    assert_eq!(
        connector.get_job_status("job-b").await.unwrap(),
        RemoteJobStatus::Provisioning
    );
}

// =============================================================================
// Serverless connector
// =============================================================================

#[tokio::test]
async fn test_serverless_submit_and_inline_artifact() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v2/account", 200, json!({"id": "u-1", "email": "ml@example.com"})).await;
    Mock::given(method("POST"))
        .and(path("/v2/trainer/run"))
        .and(body_partial_json(json!({"policy": {"gpu_type_ids": ["gpu_1x_a100"]}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "req-1", "status": "IN_QUEUE"})))
        .mount(&server)
        .await;
    let encoded = base64::engine::general_purpose::STANDARD.encode(b"adapter");
    mount_json(
        &server,
        "GET",
        "/v2/trainer/status/req-1",
        200,
        json!({"id": "req-1", "status": "COMPLETED", "output": {"artifact_base64": encoded}}),
    )
    .await;

    let connector = ServerlessConnector::new("runpod", server.uri(), "trainer").unwrap();
    let handle = connector.connect(&secrets()).await.unwrap();
    assert_eq!(handle.account.as_deref(), Some("ml@example.com"));

    let remote_id = connector.submit_job(&job_config(), "key-s1").await.unwrap();
    assert_eq!(remote_id, "req-1");
    assert_eq!(
        connector.get_job_status("req-1").await.unwrap(),
        RemoteJobStatus::Succeeded
    );
    assert_eq!(connector.fetch_artifact("req-1").await.unwrap(), b"adapter");
}

#[tokio::test]
async fn test_serverless_endpoint_deploys_and_stops() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/v2/account", 200, json!({"id": "u-1"})).await;
    Mock::given(method("POST"))
        .and(path("/v2/endpoints"))
        .and(body_partial_json(json!({"workers_min": 1, "workers_max": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ep-1"})))
        .mount(&server)
        .await;
    mount_json(&server, "GET", "/v2/endpoints/ep-1", 200, json!({"id": "ep-1", "status": "READY"})).await;
    Mock::given(method("GET"))
        .and(path("/v2/ep-1/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/endpoints/ep-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let connector = Arc::new(ServerlessConnector::new("runpod", server.uri(), "trainer").unwrap());
    connector.connect(&secrets()).await.unwrap();
    assert_eq!(
        connector.get_deployment_status("ep-1").await.unwrap(),
        RemoteDeploymentStatus::Ready {
            endpoint_url: format!("{}/v2/ep-1", server.uri())
        }
    );

    let mut registry = ConnectorRegistry::new();
    registry.register("runpod", ConnectorKind::Serverless, connector);
    let manager = DeploymentManager::new(
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(MetricsAggregator::new(WindowConfig::default())),
        manager_config(),
    );

    let deployment = manager.deploy("runpod", deployment_config()).await.unwrap();
    let active = manager
        .wait_for_status(&deployment.id, &[DeploymentStatus::Active], WAIT)
        .await
        .unwrap();
    assert_eq!(active.remote_id.as_deref(), Some("ep-1"));

    let stopped = manager.stop(&active.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(stopped.error_kind.is_none());
}
