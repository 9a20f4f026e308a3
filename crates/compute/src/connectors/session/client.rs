//! Machine-provisioning provider driven over a remote command session.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::models::{
    ApiResponse, CreateVirtualMachineAttributes, CreateVirtualMachineBody,
    CreateVirtualMachineData, ProjectResource, VirtualMachinePlanResource, VirtualMachineResource,
};
use super::shell::{shell_quote, RemoteSession};
use crate::connectors::http::{encode_query, ApiClient};
use crate::connectors::traits::{Connector, ServingConnector};
use crate::credentials::SecretBundle;
use crate::error::ConnectorError;
use crate::models::{
    Availability, ConnectionHandle, DeploymentConfig, JobConfig, LogLine, LogPage, PricingInfo,
    RemoteDeploymentStatus, RemoteJobStatus, Resource, ScalingConfig, UpdateOutcome,
};

/// Working directory of a training job on the machine.
const JOB_DIR: &str = "compute-job";

/// Working directory of a served model on the machine.
const SERVE_DIR: &str = "compute-serve";

/// Port the inference server listens on.
const SERVE_PORT: u16 = 8000;

/// Remote exit code: artifact not produced yet.
const EXIT_NOT_READY: i32 = 3;

/// Remote exit code: no artifact.
const EXIT_NOT_FOUND: i32 = 4;

/// Machines are billed by the hour.
const BILLING_INCREMENT_SECS: u64 = 3600;

/// Machine state relevant to a job or endpoint.
enum Machine {
    /// Not reachable yet.
    Booting,
    /// Reachable at `host` as `user`.
    Up { name: String, host: String, user: String },
    /// Stopped outside our control.
    Stopped,
}

/// Provider that rents a whole machine per job and runs it over SSH.
///
/// The machine's name carries the submission's idempotency key, which is how
/// `find_job` recovers a machine whose creation response was lost.
pub struct SessionConnector {
    name: String,
    api: ApiClient,
    session: Arc<dyn RemoteSession>,
    project: RwLock<Option<String>>,
    default_user: String,
    ssh_keys: Vec<String>,
    /// Launch scripts by machine name, run once the machine is reachable.
    launch_plans: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for SessionConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnector")
            .field("name", &self.name)
            .field("base_url", &self.api.base_url())
            .finish_non_exhaustive()
    }
}

impl SessionConnector {
    /// Create a connector for the provisioning API at `base_url`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        session: Arc<dyn RemoteSession>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: name.into(),
            api: ApiClient::new(base_url)?,
            session,
            project: RwLock::new(None),
            default_user: "ubuntu".to_string(),
            ssh_keys: Vec::new(),
            launch_plans: Mutex::new(HashMap::new()),
        })
    }

    /// Project used when the credentials do not name one.
    #[must_use]
    pub fn with_project(self, project: impl Into<String>) -> Self {
        if let Ok(mut slot) = self.project.write() {
            *slot = Some(project.into());
        }
        self
    }

    /// Login user when the provider does not report one.
    #[must_use]
    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    /// SSH key IDs installed on new machines.
    #[must_use]
    pub fn with_ssh_keys(mut self, keys: Vec<String>) -> Self {
        self.ssh_keys = keys;
        self
    }

    fn project(&self) -> Result<String, ConnectorError> {
        self.project
            .read()
            .ok()
            .and_then(|p| p.clone())
            .ok_or_else(|| ConnectorError::Auth("not connected: no project".into()))
    }

    fn job_machine_name(idempotency_key: &str) -> String {
        format!("compute-{idempotency_key}")
    }

    fn remember_plan(&self, machine_name: &str, script: String) {
        if let Ok(mut plans) = self.launch_plans.lock() {
            plans.insert(machine_name.to_string(), script);
        }
    }

    fn plan_for(&self, machine_name: &str) -> Option<String> {
        self.launch_plans
            .lock()
            .ok()
            .and_then(|plans| plans.get(machine_name).cloned())
    }

    fn forget_plan(&self, machine_name: &str) {
        if let Ok(mut plans) = self.launch_plans.lock() {
            plans.remove(machine_name);
        }
    }

    async fn create_machine(&self, name: &str, plan: &str) -> Result<String, ConnectorError> {
        info!(provider = %self.name, name = %name, plan = %plan, "Creating machine");

        let body = CreateVirtualMachineBody {
            data: CreateVirtualMachineData {
                resource_type: "virtual_machines".to_string(),
                attributes: CreateVirtualMachineAttributes {
                    name: name.to_string(),
                    plan: plan.to_string(),
                    ssh_keys: self.ssh_keys.clone(),
                    project: self.project()?,
                },
            },
        };
        let response: ApiResponse<VirtualMachineResource> =
            self.api.post("/virtual_machines", &body, None).await?;

        info!(provider = %self.name, vm_id = %response.data.id, "Machine created");
        Ok(response.data.id)
    }

    async fn machine(&self, vm_id: &str) -> Result<Machine, ConnectorError> {
        let response: ApiResponse<VirtualMachineResource> = self
            .api
            .get(&format!(
                "/virtual_machines/{vm_id}?extra_fields[virtual_machines]=credentials"
            ))
            .await?;
        let attributes = response.data.attributes;

        debug!(provider = %self.name, vm_id = %vm_id, status = %attributes.status, "Polled machine");
        match attributes.status.as_str() {
            "Running" => {
                let credentials = attributes.credentials.as_ref();
                let host = credentials.and_then(|c| c.host.clone());
                let user = credentials
                    .and_then(|c| c.username.clone())
                    .unwrap_or_else(|| self.default_user.clone());
                Ok(host.map_or(Machine::Booting, |host| Machine::Up {
                    name: attributes.name,
                    host,
                    user,
                }))
            }
            "Stopped" | "Deleted" => Ok(Machine::Stopped),
            _ => Ok(Machine::Booting),
        }
    }

    async fn delete_machine(&self, vm_id: &str) -> Result<(), ConnectorError> {
        info!(provider = %self.name, vm_id = %vm_id, "Deleting machine");
        self.api.delete(&format!("/virtual_machines/{vm_id}")).await
    }

    /// Run the remembered launch script for `name` on the machine.
    async fn launch(&self, name: &str, host: &str, user: &str) -> Result<bool, ConnectorError> {
        let Some(script) = self.plan_for(name) else {
            return Ok(false);
        };
        info!(provider = %self.name, machine = %name, host = %host, "Launching remote process");
        let output = self.session.exec(host, user, &script).await?;
        if !output.success() {
            return Err(ConnectorError::Validation(format!(
                "launch failed with status {}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.forget_plan(name);
        Ok(true)
    }
}

/// Shell script that starts `command` detached inside `dir`, capturing its
/// output in `train.log` and its exit status in `exit_code`.
fn detached_script(dir: &str, exports: &str, command: &str) -> String {
    let inner = format!("{exports}{command}; echo $? > exit_code");
    format!(
        "mkdir -p {dir}/output && cd {dir} && {{ nohup sh -c {} > train.log 2>&1 < /dev/null & echo $! > pid; }}",
        shell_quote(&inner)
    )
}

/// Build the launch script of a training job.
fn job_launch_script(config: &JobConfig) -> Result<String, ConnectorError> {
    let entrypoint = config
        .entrypoint
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| {
            ConnectorError::Validation("session providers need an entrypoint command".into())
        })?;

    let hyperparameters = serde_json::to_string(&config.hyperparameters)
        .map_err(|e| ConnectorError::Validation(format!("hyperparameters: {e}")))?;

    let mut exports = String::new();
    let builtin = [
        ("BASE_MODEL", config.base_model.as_str()),
        ("DATASET_URI", config.dataset_uri.as_str()),
        ("HYPERPARAMETERS", hyperparameters.as_str()),
        ("OUTPUT_DIR", "output"),
    ];
    for (key, value) in builtin
        .into_iter()
        .chain(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConnectorError::Validation(format!(
                "invalid environment variable name `{key}`"
            )));
        }
        let _ = write!(exports, "export {key}={}; ", shell_quote(value));
    }

    Ok(detached_script(JOB_DIR, &exports, entrypoint))
}

/// Build the launch script of an inference server.
fn serve_launch_script(config: &DeploymentConfig) -> String {
    let command = format!(
        "python3 -m vllm.entrypoints.openai.api_server --host 0.0.0.0 --port {SERVE_PORT} --model {} --max-num-seqs {}",
        shell_quote(&config.model_ref),
        config.scaling.target_concurrency
    );
    detached_script(SERVE_DIR, "", &command)
}

/// Split `tail` output read from byte `from_offset` into complete lines.
///
/// A trailing partial line is only returned once the log is finished.
fn split_log(bytes: &[u8], from_offset: u64, finished: bool) -> (Vec<LogLine>, u64) {
    let mut lines = Vec::new();
    let mut cursor = from_offset;
    let mut rest = bytes;

    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
        let (line, tail) = rest.split_at(pos);
        cursor += line.len() as u64 + 1;
        lines.push(LogLine {
            next_offset: cursor,
            message: String::from_utf8_lossy(line).trim_end_matches('\r').to_string(),
            timestamp: None,
        });
        rest = &tail[1..];
    }
    if finished && !rest.is_empty() {
        cursor += rest.len() as u64;
        lines.push(LogLine {
            next_offset: cursor,
            message: String::from_utf8_lossy(rest).to_string(),
            timestamp: None,
        });
    }
    (lines, cursor)
}

#[async_trait]
impl Connector for SessionConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        credentials: &SecretBundle,
    ) -> Result<ConnectionHandle, ConnectorError> {
        self.api.set_token(credentials.require("api_key")?);
        if let Some(project) = credentials.get("project_id").filter(|p| !p.is_empty()) {
            if let Ok(mut slot) = self.project.write() {
                *slot = Some(project.to_string());
            }
        }
        let project = self.project()?;

        let response: ApiResponse<ProjectResource> =
            self.api.get(&format!("/projects/{project}")).await?;
        info!(provider = %self.name, project = %response.data.id, "Connected");

        Ok(ConnectionHandle {
            provider: self.name.clone(),
            account: Some(
                response
                    .data
                    .attributes
                    .and_then(|a| a.name)
                    .unwrap_or(response.data.id),
            ),
            connected_at: Utc::now(),
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, ConnectorError> {
        let response: ApiResponse<Vec<VirtualMachinePlanResource>> =
            self.api.get("/plans/virtual_machines").await?;

        Ok(response
            .data
            .iter()
            .map(|plan| {
                let gpu = plan.attributes.gpu.as_ref();
                Resource {
                    provider: self.name.clone(),
                    resource_id: plan.id.clone(),
                    gpu_type: gpu
                        .and_then(|g| g.model.clone())
                        .or_else(|| plan.attributes.name.clone())
                        .unwrap_or_else(|| "Unknown GPU".to_string()),
                    vram_gb: gpu.and_then(|g| g.memory_gb).unwrap_or(0)
                        * gpu.and_then(|g| g.count).unwrap_or(1),
                    hourly_rate: plan.attributes.hourly_usd(),
                    availability: plan
                        .attributes
                        .stock_level
                        .as_deref()
                        .map_or(Availability::Unknown, Availability::from_label),
                }
            })
            .collect())
    }

    async fn get_pricing(&self, resource_id: &str) -> Result<PricingInfo, ConnectorError> {
        let response: ApiResponse<VirtualMachinePlanResource> = self
            .api
            .get(&format!("/plans/virtual_machines/{resource_id}"))
            .await?;
        Ok(PricingInfo {
            resource_id: resource_id.to_string(),
            hourly_rate: response.data.attributes.hourly_usd(),
            currency: "USD".to_string(),
            billing_increment_secs: BILLING_INCREMENT_SECS,
        })
    }

    async fn submit_job(
        &self,
        config: &JobConfig,
        idempotency_key: &str,
    ) -> Result<String, ConnectorError> {
        let script = job_launch_script(config)?;
        let name = Self::job_machine_name(idempotency_key);
        // Remembered before the create call so a lost response can still be
        // launched after find_job recovers the machine.
        self.remember_plan(&name, script);
        self.create_machine(&name, &config.resource_id).await
    }

    async fn find_job(&self, idempotency_key: &str) -> Result<Option<String>, ConnectorError> {
        let project = self.project()?;
        let response: ApiResponse<Vec<VirtualMachineResource>> = self
            .api
            .get(&format!(
                "/virtual_machines?filter[project]={}",
                encode_query(&project)
            ))
            .await?;
        let name = Self::job_machine_name(idempotency_key);
        Ok(response
            .data
            .into_iter()
            .find(|vm| vm.attributes.name == name)
            .map(|vm| vm.id))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ConnectorError> {
        let (name, host, user) = match self.machine(job_id).await? {
            Machine::Booting => return Ok(RemoteJobStatus::Provisioning),
            Machine::Stopped => {
                return Ok(RemoteJobStatus::Failed(
                    "machine stopped before the job finished".into(),
                ))
            }
            Machine::Up { name, host, user } => (name, host, user),
        };

        let probe = format!(
            "cd {JOB_DIR} 2>/dev/null || {{ echo missing; exit 0; }}; \
             if [ -f exit_code ]; then echo \"exit:$(cat exit_code)\"; else echo running; fi"
        );
        let output = match self.session.exec(&host, &user, &probe).await {
            Ok(output) => output,
            // sshd is usually the last thing to come up
            Err(ConnectorError::Transient(msg)) => {
                debug!(provider = %self.name, vm_id = %job_id, error = %msg, "Machine not reachable yet");
                return Ok(RemoteJobStatus::Provisioning);
            }
            Err(e) => return Err(e),
        };

        let stdout = output.stdout_text();
        let state = stdout.trim();
        match state {
            "running" => Ok(RemoteJobStatus::Running),
            "missing" => {
                if self.launch(&name, &host, &user).await? {
                    Ok(RemoteJobStatus::Running)
                } else {
                    Ok(RemoteJobStatus::Failed(
                        "machine is up but the job was never started; resubmit it".into(),
                    ))
                }
            }
            _ => match state.strip_prefix("exit:").map(str::trim) {
                Some("0") => Ok(RemoteJobStatus::Succeeded),
                Some(code) => Ok(RemoteJobStatus::Failed(format!(
                    "training exited with status {code}"
                ))),
                None => Err(ConnectorError::Transient(format!(
                    "unexpected probe output: {state}"
                ))),
            },
        }
    }

    async fn cancel_job(&self, job_id: &str) -> Result<bool, ConnectorError> {
        info!(provider = %self.name, vm_id = %job_id, "Cancelling job");

        if let Ok(Machine::Up { name, host, user }) = self.machine(job_id).await {
            let kill = format!("kill $(cat {JOB_DIR}/pid) 2>/dev/null; true");
            if let Err(e) = self.session.exec(&host, &user, &kill).await {
                warn!(provider = %self.name, vm_id = %job_id, error = %e, "Failed to stop remote process");
            }
            self.forget_plan(&name);
        }

        self.delete_machine(job_id).await?;
        Ok(true)
    }

    async fn read_logs(&self, job_id: &str, from_offset: u64) -> Result<LogPage, ConnectorError> {
        let empty = LogPage {
            lines: Vec::new(),
            next_offset: from_offset,
            finished: false,
        };
        // A released machine is gone from the API; its log ended with it.
        let (host, user) = match self.machine(job_id).await {
            Ok(Machine::Up { host, user, .. }) => (host, user),
            Ok(Machine::Booting) => return Ok(empty),
            Ok(Machine::Stopped) | Err(ConnectorError::NotFound(_)) => {
                return Ok(LogPage { finished: true, ..empty })
            }
            Err(e) => return Err(e),
        };

        let command = format!(
            "cd {JOB_DIR} 2>/dev/null || exit 0; \
             if [ -f exit_code ]; then echo done; else echo live; fi; \
             tail -c +{} train.log 2>/dev/null",
            from_offset + 1
        );
        let output = self.session.exec(&host, &user, &command).await?;

        let Some(split) = output.stdout.iter().position(|&b| b == b'\n') else {
            return Ok(empty);
        };
        let finished = &output.stdout[..split] == b"done";
        let (lines, next_offset) = split_log(&output.stdout[split + 1..], from_offset, finished);

        Ok(LogPage {
            lines,
            next_offset,
            finished,
        })
    }

    async fn fetch_artifact(&self, job_id: &str) -> Result<Vec<u8>, ConnectorError> {
        let (host, user) = match self.machine(job_id).await {
            Ok(Machine::Up { host, user, .. }) => (host, user),
            Ok(Machine::Booting) => return Err(ConnectorError::ArtifactNotReady(job_id.into())),
            Ok(Machine::Stopped) | Err(ConnectorError::NotFound(_)) => {
                return Err(ConnectorError::ArtifactNotFound(job_id.into()))
            }
            Err(e) => return Err(e),
        };

        let command = format!(
            "cd {JOB_DIR} 2>/dev/null || exit {EXIT_NOT_FOUND}; \
             [ -f exit_code ] || exit {EXIT_NOT_READY}; \
             [ -n \"$(ls -A output 2>/dev/null)\" ] || exit {EXIT_NOT_FOUND}; \
             tar -czf - -C output . | base64 | tr -d '\\n'"
        );
        let output = self.session.exec(&host, &user, &command).await?;

        match output.exit_code {
            0 => base64::engine::general_purpose::STANDARD
                .decode(output.stdout.trim_ascii())
                .map_err(|e| ConnectorError::Transient(format!("corrupt artifact stream: {e}"))),
            EXIT_NOT_READY => Err(ConnectorError::ArtifactNotReady(job_id.into())),
            EXIT_NOT_FOUND => Err(ConnectorError::ArtifactNotFound(job_id.into())),
            code => Err(ConnectorError::Transient(format!(
                "artifact export exited with status {code}"
            ))),
        }
    }

    async fn release_job(&self, job_id: &str) -> Result<(), ConnectorError> {
        self.delete_machine(job_id).await
    }
}

#[async_trait]
impl ServingConnector for SessionConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn create_deployment(
        &self,
        config: &DeploymentConfig,
    ) -> Result<String, ConnectorError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("serve-{}-{}", config.name, &suffix[..8]);
        self.remember_plan(&name, serve_launch_script(config));
        self.create_machine(&name, &config.resource_id).await
    }

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> Result<RemoteDeploymentStatus, ConnectorError> {
        let (name, host, user) = match self.machine(deployment_id).await? {
            Machine::Booting => return Ok(RemoteDeploymentStatus::Deploying),
            Machine::Stopped => return Ok(RemoteDeploymentStatus::Stopped),
            Machine::Up { name, host, user } => (name, host, user),
        };

        let probe = format!(
            "[ -f {SERVE_DIR}/pid ] || {{ echo missing; exit 0; }}; \
             curl -sf http://127.0.0.1:{SERVE_PORT}/health > /dev/null && echo ready || echo starting"
        );
        let output = match self.session.exec(&host, &user, &probe).await {
            Ok(output) => output,
            Err(ConnectorError::Transient(_)) => return Ok(RemoteDeploymentStatus::Deploying),
            Err(e) => return Err(e),
        };

        match output.stdout_text().trim() {
            "ready" => Ok(RemoteDeploymentStatus::Ready {
                endpoint_url: format!("http://{host}:{SERVE_PORT}"),
            }),
            "missing" => {
                if self.launch(&name, &host, &user).await? {
                    Ok(RemoteDeploymentStatus::Deploying)
                } else {
                    Ok(RemoteDeploymentStatus::Failed {
                        message: "machine is up but the server was never started".into(),
                    })
                }
            }
            _ => Ok(RemoteDeploymentStatus::Deploying),
        }
    }

    async fn update_config(
        &self,
        _deployment_id: &str,
        _scaling: &ScalingConfig,
    ) -> Result<UpdateOutcome, ConnectorError> {
        // One server per machine; new settings need a new machine.
        Ok(UpdateOutcome::RequiresRedeploy)
    }

    async fn health_check(&self, endpoint_url: &str) -> Result<bool, ConnectorError> {
        let url = format!("{}/health", endpoint_url.trim_end_matches('/'));
        let status = self.api.probe(&url).await?;
        Ok((200..300).contains(&status))
    }

    async fn stop_deployment(&self, deployment_id: &str) -> Result<bool, ConnectorError> {
        self.delete_machine(deployment_id).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_keeps_partial_line_until_finished() {
        let (lines, next) = split_log(b"step 1\nstep 2\npart", 10, false);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "step 1");
        assert_eq!(lines[0].next_offset, 17);
        assert_eq!(lines[1].next_offset, 24);
        assert_eq!(next, 24);

        let (lines, next) = split_log(b"part", 24, true);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "part");
        assert_eq!(next, 28);
    }

    #[test]
    fn test_job_launch_script_requires_entrypoint() {
        let config = JobConfig::new("ft", "vm.h100", "llama", "s3://d");
        assert!(matches!(
            job_launch_script(&config),
            Err(ConnectorError::Validation(_))
        ));
    }

    #[test]
    fn test_job_launch_script_exports_env() {
        let mut config = JobConfig::new("ft", "vm.h100", "llama", "s3://d");
        config.entrypoint = Some("python3 train.py".into());
        config.env.insert("WANDB_MODE".into(), "off".into());

        let script = job_launch_script(&config).unwrap();
        assert!(script.starts_with("mkdir -p compute-job/output && cd compute-job"));
        assert!(script.contains("WANDB_MODE="));
        assert!(script.contains("python3 train.py; echo $? > exit_code"));

        config.env.insert("BAD KEY".into(), "x".into());
        assert!(job_launch_script(&config).is_err());
    }
}
