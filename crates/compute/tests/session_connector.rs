//! Session connector against a mock provisioning API and a scripted shell.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use common::{orchestrator_config, WAIT};
use compute::connectors::session::{CommandOutput, RemoteSession, SessionConnector};
use compute::{
    Connector, ConnectorError, ConnectorKind, ConnectorRegistry, JobConfig, JobOrchestrator,
    JobStatus, MemoryStore, SecretBundle,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Remote machine whose shell answers the connector's commands from memory.
#[derive(Default)]
struct ScriptedMachine {
    state: Mutex<MachineState>,
}

#[derive(Default)]
struct MachineState {
    launched: bool,
    exit_code: Option<i32>,
    log: Vec<u8>,
    artifact_exits: VecDeque<i32>,
    artifact: Vec<u8>,
    launches: usize,
}

impl ScriptedMachine {
    fn finished_on_launch(code: i32) -> Self {
        let machine = Self::default();
        machine.state.lock().unwrap().exit_code = Some(code);
        machine
    }

    fn start(&self) {
        self.state.lock().unwrap().launched = true;
    }

    fn append_log(&self, text: &str) {
        self.state.lock().unwrap().log.extend_from_slice(text.as_bytes());
    }

    fn exit(&self, code: i32) {
        self.state.lock().unwrap().exit_code = Some(code);
    }

    fn script_artifact(&self, exits: &[i32], artifact: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.artifact_exits = exits.iter().copied().collect();
        state.artifact = artifact.to_vec();
    }

    fn launches(&self) -> usize {
        self.state.lock().unwrap().launches
    }
}

fn output(exit_code: i32, stdout: Vec<u8>) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout,
        stderr: Vec::new(),
    }
}

#[async_trait]
impl RemoteSession for ScriptedMachine {
    async fn exec(
        &self,
        _host: &str,
        _user: &str,
        command: &str,
    ) -> Result<CommandOutput, ConnectorError> {
        let mut state = self.state.lock().unwrap();

        if command.contains("nohup") {
            state.launched = true;
            state.launches += 1;
            return Ok(output(0, Vec::new()));
        }
        if command.contains("tar -czf") {
            let code = if state.artifact_exits.len() > 1 {
                state.artifact_exits.pop_front().unwrap_or(0)
            } else {
                state.artifact_exits.front().copied().unwrap_or(0)
            };
            let stdout = if code == 0 {
                base64::engine::general_purpose::STANDARD
                    .encode(&state.artifact)
                    .into_bytes()
            } else {
                Vec::new()
            };
            return Ok(output(code, stdout));
        }
        if let Some(rest) = command.split("tail -c +").nth(1) {
            let start: usize = rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap();
            let mut stdout = if state.exit_code.is_some() {
                b"done\n".to_vec()
            } else {
                b"live\n".to_vec()
            };
            stdout.extend_from_slice(state.log.get(start - 1..).unwrap_or_default());
            return Ok(output(0, stdout));
        }
        if command.contains("echo missing") {
            let answer = match (state.launched, state.exit_code) {
                (false, _) => "missing".to_string(),
                (true, Some(code)) => format!("exit:{code}"),
                (true, None) => "running".to_string(),
            };
            return Ok(output(0, format!("{answer}\n").into_bytes()));
        }
        Ok(output(0, Vec::new()))
    }
}

fn secrets() -> SecretBundle {
    SecretBundle::new()
        .with("api_key", "test-key")
        .with("project_id", "proj-1")
}

fn machine_json(id: &str, name: &str) -> serde_json::Value {
    json!({
        "id": id,
        "attributes": {
            "name": name,
            "status": "Running",
            "credentials": {"host": "10.0.0.7", "username": "ubuntu"}
        }
    })
}

async fn provisioning_api() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects/proj-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"id": "proj-1", "attributes": {"name": "research"}}})),
        )
        .mount(&server)
        .await;
    server
}

async fn mount_machine(server: &MockServer, id: &str, name: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/virtual_machines/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": machine_json(id, name)})))
        .mount(server)
        .await;
}

async fn connected(server: &MockServer, machine: &Arc<ScriptedMachine>) -> SessionConnector {
    let connector =
        SessionConnector::new("vmcloud", server.uri(), machine.clone() as Arc<dyn RemoteSession>)
            .unwrap();
    connector.connect(&secrets()).await.unwrap();
    connector
}

fn training_config() -> JobConfig {
    let mut config = JobConfig::new("ft-llama", "vm.h100", "llama-3-8b", "s3://datasets/train.jsonl");
    config.entrypoint = Some("python3 train.py".into());
    config
}

#[tokio::test]
async fn test_session_lost_create_is_recovered_and_launched() {
    let server = provisioning_api().await;
    Mock::given(method("POST"))
        .and(path("/virtual_machines"))
        .respond_with(ResponseTemplate::new(504).set_body_string("upstream timed out"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/virtual_machines"))
        .and(query_param("filter[project]", "proj-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                machine_json("vm-3", "compute-someone-else"),
                machine_json("vm-7", "compute-key-sess-1"),
            ]
        })))
        .mount(&server)
        .await;
    mount_machine(&server, "vm-7", "compute-key-sess-1").await;
    Mock::given(method("GET"))
        .and(path("/plans/virtual_machines/vm.h100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"id": "vm.h100", "attributes": {"regions": [{"pricing": {"USD": {"hour": 2.5}}}]}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/virtual_machines/vm-7"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let machine = Arc::new(ScriptedMachine::finished_on_launch(0));
    machine.script_artifact(&[3, 0], b"adapter.safetensors");
    let connector = connected(&server, &machine).await;
    let mut registry = ConnectorRegistry::new();
    registry.register("vmcloud", ConnectorKind::Session, Arc::new(connector));
    let orchestrator =
        JobOrchestrator::new(registry, Arc::new(MemoryStore::new()), orchestrator_config());

    let job = orchestrator
        .submit("vmcloud", training_config(), Some("key-sess-1".into()))
        .await
        .unwrap();
    assert_eq!(job.remote_id.as_deref(), Some("vm-7"));

    let done = orchestrator.wait_for_terminal(&job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(machine.launches(), 1);
    assert_eq!(
        orchestrator.fetch_artifact(&job.id).await.unwrap(),
        b"adapter.safetensors"
    );
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_session_find_job_without_match_is_none() {
    let server = provisioning_api().await;
    Mock::given(method("GET"))
        .and(path("/virtual_machines"))
        .and(query_param("filter[project]", "proj-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [machine_json("vm-3", "compute-someone-else")]
        })))
        .mount(&server)
        .await;

    let machine = Arc::new(ScriptedMachine::default());
    let connector = connected(&server, &machine).await;

    assert_eq!(connector.find_job("key-sess-1").await.unwrap(), None);
}

#[tokio::test]
async fn test_session_log_tail_resumes_without_duplicates() {
    let server = provisioning_api().await;
    mount_machine(&server, "vm-7", "compute-key-sess-1").await;
    let machine = Arc::new(ScriptedMachine::default());
    machine.start();
    machine.append_log("step 1\nstep 2\npar");
    let connector = connected(&server, &machine).await;

    let page = connector.read_logs("vm-7", 0).await.unwrap();
    let messages: Vec<_> = page.lines.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["step 1", "step 2"]);
    assert_eq!(page.next_offset, 14);
    assert!(!page.finished);

    // Nothing new yet: the partial line is held back.
    let idle = connector.read_logs("vm-7", page.next_offset).await.unwrap();
    assert!(idle.lines.is_empty());
    assert_eq!(idle.next_offset, 14);

    machine.append_log("tial\nstep 3\n");
    let page = connector.read_logs("vm-7", idle.next_offset).await.unwrap();
    let messages: Vec<_> = page.lines.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["partial", "step 3"]);

    // Resuming from a line cursor picks up right after that line.
    let resumed = connector.read_logs("vm-7", 7).await.unwrap();
    let messages: Vec<_> = resumed.lines.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["step 2", "partial", "step 3"]);

    machine.exit(0);
    let last = connector.read_logs("vm-7", page.next_offset).await.unwrap();
    assert!(last.lines.is_empty());
    assert!(last.finished);
}

#[tokio::test]
async fn test_session_artifact_exit_codes() {
    let server = provisioning_api().await;
    mount_machine(&server, "vm-7", "compute-key-sess-1").await;
    let machine = Arc::new(ScriptedMachine::finished_on_launch(0));
    let connector = connected(&server, &machine).await;

    machine.script_artifact(&[3], b"");
    assert!(matches!(
        connector.fetch_artifact("vm-7").await,
        Err(ConnectorError::ArtifactNotReady(_))
    ));

    machine.script_artifact(&[4], b"");
    assert!(matches!(
        connector.fetch_artifact("vm-7").await,
        Err(ConnectorError::ArtifactNotFound(_))
    ));

    machine.script_artifact(&[0], b"weights");
    assert_eq!(connector.fetch_artifact("vm-7").await.unwrap(), b"weights");
}

#[tokio::test]
async fn test_session_released_machine_logs_are_finished() {
    let server = provisioning_api().await;
    Mock::given(method("GET"))
        .and(path("/virtual_machines/vm-gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errors": ["not found"]})))
        .mount(&server)
        .await;
    let machine = Arc::new(ScriptedMachine::default());
    let connector = connected(&server, &machine).await;

    let page = connector.read_logs("vm-gone", 42).await.unwrap();
    assert!(page.finished);
    assert!(page.lines.is_empty());
    assert_eq!(page.next_offset, 42);
}
