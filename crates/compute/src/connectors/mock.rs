//! Scripted in-process connector.
//!
//! Backs the `mock` provider kind and the test suites. Every remote
//! behaviour the orchestrator must survive can be scripted: status
//! sequences, transient and capacity failures, lost submission responses,
//! unacknowledged cancels, missing artifacts and flapping health checks.
//!
//! Submissions are deliberately *not* deduplicated on the provider side:
//! each accepted `submit_job` creates a new remote job, so duplicate
//! submissions are observable through [`MockConnector::accepted_jobs`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::traits::{Connector, ServingConnector};
use crate::credentials::SecretBundle;
use crate::error::ConnectorError;
use crate::models::{
    Availability, ConnectionHandle, DeploymentConfig, JobConfig, LogLine, LogPage, PricingInfo,
    RemoteDeploymentStatus, RemoteJobStatus, Resource, ScalingConfig, UpdateOutcome,
};

/// Lines returned per `read_logs` call.
const LOG_PAGE_SIZE: usize = 2;

/// Pops the front of a script, repeating the last entry forever.
fn next_scripted<T: Clone>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

#[derive(Debug)]
struct MockJob {
    idempotency_key: String,
    statuses: VecDeque<Result<RemoteJobStatus, ConnectorError>>,
}

#[derive(Debug)]
struct MockDeployment {
    statuses: VecDeque<RemoteDeploymentStatus>,
    scaling: ScalingConfig,
}

#[derive(Debug)]
struct State {
    offline: bool,
    reject_credentials: bool,
    resources: Vec<Resource>,
    status_script: Vec<Result<RemoteJobStatus, ConnectorError>>,
    submit_errors: VecDeque<ConnectorError>,
    lost_responses: u32,
    no_capacity: HashSet<String>,
    artifacts: VecDeque<Result<Vec<u8>, ConnectorError>>,
    cancel_ack: bool,
    hang_cancel: bool,
    logs: Vec<String>,
    logs_finished: bool,
    jobs: HashMap<String, MockJob>,
    submissions: Vec<(String, String)>,
    find_calls: u32,
    status_calls: u32,
    cancel_calls: Vec<String>,
    released: Vec<String>,
    next_id: u32,
    deploy_script: Vec<RemoteDeploymentStatus>,
    create_errors: VecDeque<ConnectorError>,
    deployments: HashMap<String, MockDeployment>,
    update_outcome: UpdateOutcome,
    update_calls: Vec<(String, ScalingConfig)>,
    health: VecDeque<bool>,
    stop_ack: bool,
    stopped: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            offline: false,
            reject_credentials: false,
            resources: Vec::new(),
            status_script: vec![
                Ok(RemoteJobStatus::Running),
                Ok(RemoteJobStatus::Succeeded),
            ],
            submit_errors: VecDeque::new(),
            lost_responses: 0,
            no_capacity: HashSet::new(),
            artifacts: VecDeque::from([Ok(b"adapter-weights".to_vec())]),
            cancel_ack: true,
            hang_cancel: false,
            logs: Vec::new(),
            logs_finished: false,
            jobs: HashMap::new(),
            submissions: Vec::new(),
            find_calls: 0,
            status_calls: 0,
            cancel_calls: Vec::new(),
            released: Vec::new(),
            next_id: 0,
            deploy_script: vec![RemoteDeploymentStatus::Deploying],
            create_errors: VecDeque::new(),
            deployments: HashMap::new(),
            update_outcome: UpdateOutcome::Applied,
            update_calls: Vec::new(),
            health: VecDeque::from([true]),
            stop_ack: true,
            stopped: Vec::new(),
        }
    }
}

/// Scripted connector; clones share state.
#[derive(Debug, Clone)]
pub struct MockConnector {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    /// Create a connector that runs every job to success with an artifact.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_online(state: &State) -> Result<(), ConnectorError> {
        if state.offline {
            Err(ConnectorError::Transient("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn next_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Make every call fail with a transient connection error.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make `connect` fail with an auth error.
    pub fn reject_credentials(&self, reject: bool) {
        self.state().reject_credentials = reject;
    }

    /// Catalog returned by `list_resources` and `get_pricing`.
    pub fn set_resources(&self, resources: Vec<Resource>) {
        self.state().resources = resources;
    }

    /// Status sequence for jobs submitted from now on; the last entry repeats.
    pub fn script_status(&self, script: Vec<Result<RemoteJobStatus, ConnectorError>>) {
        self.state().status_script = script;
    }

    /// Errors returned by the next submissions, in order.
    pub fn fail_submissions(&self, errors: Vec<ConnectorError>) {
        self.state().submit_errors.extend(errors);
    }

    /// Accept the next `count` submissions but report a transient error.
    pub fn lose_responses(&self, count: u32) {
        self.state().lost_responses = count;
    }

    /// Reject submissions on `resource_id` with a capacity error.
    pub fn no_capacity(&self, resource_id: impl Into<String>) {
        self.state().no_capacity.insert(resource_id.into());
    }

    /// Artifact fetch results, in order; the last entry repeats.
    pub fn script_artifact(&self, script: Vec<Result<Vec<u8>, ConnectorError>>) {
        self.state().artifacts = script.into();
    }

    /// Whether `cancel_job` acknowledges.
    pub fn set_cancel_ack(&self, ack: bool) {
        self.state().cancel_ack = ack;
    }

    /// Make `cancel_job` never return.
    pub fn hang_cancel(&self, hang: bool) {
        self.state().hang_cancel = hang;
    }

    /// Append log output.
    pub fn push_logs<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().logs.extend(lines.into_iter().map(Into::into));
    }

    /// Mark the log complete.
    pub fn finish_logs(&self) {
        self.state().logs_finished = true;
    }

    /// Status sequence for deployments created from now on; the last entry repeats.
    pub fn script_deployment(&self, script: Vec<RemoteDeploymentStatus>) {
        self.state().deploy_script = script;
    }

    /// Errors returned by the next `create_deployment` calls.
    pub fn fail_deployments(&self, errors: Vec<ConnectorError>) {
        self.state().create_errors.extend(errors);
    }

    /// Outcome of `update_config`.
    pub fn set_update_outcome(&self, outcome: UpdateOutcome) {
        self.state().update_outcome = outcome;
    }

    /// Health check results, in order; the last entry repeats.
    pub fn script_health(&self, script: Vec<bool>) {
        self.state().health = script.into();
    }

    /// Whether `stop_deployment` acknowledges.
    pub fn set_stop_ack(&self, ack: bool) {
        self.state().stop_ack = ack;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Every `submit_job` call that reached the provider, as `(key, resource)`.
    #[must_use]
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.state().submissions.clone()
    }

    /// Remote jobs created under `idempotency_key`.
    #[must_use]
    pub fn accepted_jobs(&self, idempotency_key: &str) -> usize {
        self.state()
            .jobs
            .values()
            .filter(|j| j.idempotency_key == idempotency_key)
            .count()
    }

    /// Total remote jobs created.
    #[must_use]
    pub fn total_jobs(&self) -> usize {
        self.state().jobs.len()
    }

    /// Number of `find_job` calls.
    #[must_use]
    pub fn find_calls(&self) -> u32 {
        self.state().find_calls
    }

    /// Number of `get_job_status` calls.
    #[must_use]
    pub fn status_calls(&self) -> u32 {
        self.state().status_calls
    }

    /// Remote job IDs passed to `cancel_job`.
    #[must_use]
    pub fn cancel_calls(&self) -> Vec<String> {
        self.state().cancel_calls.clone()
    }

    /// Remote job IDs passed to `release_job`.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.state().released.clone()
    }

    /// Deployments created.
    #[must_use]
    pub fn deployment_count(&self) -> usize {
        self.state().deployments.len()
    }

    /// Scaling currently applied to a remote deployment.
    #[must_use]
    pub fn deployment_scaling(&self, remote_id: &str) -> Option<ScalingConfig> {
        self.state()
            .deployments
            .get(remote_id)
            .map(|d| d.scaling.clone())
    }

    /// `update_config` calls, as `(remote_id, scaling)`.
    #[must_use]
    pub fn update_calls(&self) -> Vec<(String, ScalingConfig)> {
        self.state().update_calls.clone()
    }

    /// Remote deployment IDs passed to `stop_deployment`.
    #[must_use]
    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        _credentials: &SecretBundle,
    ) -> Result<ConnectionHandle, ConnectorError> {
        let state = self.state();
        Self::check_online(&state)?;
        if state.reject_credentials {
            return Err(ConnectorError::Auth("invalid API key".into()));
        }
        Ok(ConnectionHandle {
            provider: self.name.clone(),
            account: Some("mock-account".into()),
            connected_at: Utc::now(),
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, ConnectorError> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state.resources.clone())
    }

    async fn get_pricing(&self, resource_id: &str) -> Result<PricingInfo, ConnectorError> {
        let state = self.state();
        Self::check_online(&state)?;
        let hourly_rate = state
            .resources
            .iter()
            .find(|r| r.resource_id == resource_id)
            .map(|r| r.hourly_rate)
            .ok_or_else(|| ConnectorError::NotFound(format!("resource {resource_id}")))?;
        Ok(PricingInfo {
            resource_id: resource_id.to_string(),
            hourly_rate,
            currency: "USD".into(),
            billing_increment_secs: 60,
        })
    }

    async fn submit_job(
        &self,
        config: &JobConfig,
        idempotency_key: &str,
    ) -> Result<String, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state
            .submissions
            .push((idempotency_key.to_string(), config.resource_id.clone()));

        if let Some(err) = state.submit_errors.pop_front() {
            return Err(err);
        }
        if state.no_capacity.contains(&config.resource_id) {
            return Err(ConnectorError::Provisioning(format!(
                "no capacity for {}",
                config.resource_id
            )));
        }

        let id = Self::next_id(&mut state, "mock-job");
        let statuses = state.status_script.clone().into();
        state.jobs.insert(
            id.clone(),
            MockJob {
                idempotency_key: idempotency_key.to_string(),
                statuses,
            },
        );

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(ConnectorError::Transient(
                "connection reset while reading response".into(),
            ));
        }
        Ok(id)
    }

    async fn find_job(&self, idempotency_key: &str) -> Result<Option<String>, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state.find_calls += 1;
        let mut matches: Vec<&String> = state
            .jobs
            .iter()
            .filter(|(_, j)| j.idempotency_key == idempotency_key)
            .map(|(id, _)| id)
            .collect();
        matches.sort();
        Ok(matches.first().map(|id| (*id).clone()))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state.status_calls += 1;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConnectorError::NotFound(format!("job {job_id}")))?;
        next_scripted(&mut job.statuses).unwrap_or(Ok(RemoteJobStatus::Running))
    }

    async fn cancel_job(&self, job_id: &str) -> Result<bool, ConnectorError> {
        let (hang, ack) = {
            let mut state = self.state();
            Self::check_online(&state)?;
            state.cancel_calls.push(job_id.to_string());
            if state.cancel_ack {
                if let Some(job) = state.jobs.get_mut(job_id) {
                    job.statuses = VecDeque::from([Ok(RemoteJobStatus::Cancelled)]);
                }
            }
            (state.hang_cancel, state.cancel_ack)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(ack)
    }

    async fn read_logs(&self, _job_id: &str, from_offset: u64) -> Result<LogPage, ConnectorError> {
        let state = self.state();
        Self::check_online(&state)?;

        let start = usize::try_from(from_offset)
            .unwrap_or(usize::MAX)
            .min(state.logs.len());
        let end = (start + LOG_PAGE_SIZE).min(state.logs.len());
        let lines: Vec<LogLine> = state.logs[start..end]
            .iter()
            .enumerate()
            .map(|(i, message)| LogLine {
                next_offset: (start + i + 1) as u64,
                message: message.clone(),
                timestamp: None,
            })
            .collect();

        Ok(LogPage {
            next_offset: end as u64,
            finished: state.logs_finished && end == state.logs.len(),
            lines,
        })
    }

    async fn fetch_artifact(&self, _job_id: &str) -> Result<Vec<u8>, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        next_scripted(&mut state.artifacts)
            .unwrap_or_else(|| Err(ConnectorError::ArtifactNotFound("no artifact".into())))
    }

    async fn release_job(&self, job_id: &str) -> Result<(), ConnectorError> {
        self.state().released.push(job_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ServingConnector for MockConnector {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn create_deployment(
        &self,
        config: &DeploymentConfig,
    ) -> Result<String, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }
        let id = Self::next_id(&mut state, "mock-dep");
        let statuses = state
            .deploy_script
            .iter()
            .cloned()
            .map(|s| match s {
                RemoteDeploymentStatus::Ready { endpoint_url } if endpoint_url.is_empty() => {
                    RemoteDeploymentStatus::Ready {
                        endpoint_url: format!("http://mock.local/{id}"),
                    }
                }
                other => other,
            })
            .collect();
        state.deployments.insert(
            id.clone(),
            MockDeployment {
                statuses,
                scaling: config.scaling.clone(),
            },
        );
        Ok(id)
    }

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> Result<RemoteDeploymentStatus, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        let deployment = state
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| ConnectorError::NotFound(format!("deployment {deployment_id}")))?;
        Ok(next_scripted(&mut deployment.statuses).unwrap_or(RemoteDeploymentStatus::Deploying))
    }

    async fn update_config(
        &self,
        deployment_id: &str,
        scaling: &ScalingConfig,
    ) -> Result<UpdateOutcome, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state
            .update_calls
            .push((deployment_id.to_string(), scaling.clone()));
        let outcome = state.update_outcome;
        if outcome == UpdateOutcome::Applied {
            if let Some(deployment) = state.deployments.get_mut(deployment_id) {
                deployment.scaling = scaling.clone();
            }
        }
        Ok(outcome)
    }

    async fn health_check(&self, _endpoint_url: &str) -> Result<bool, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        Ok(next_scripted(&mut state.health).unwrap_or(true))
    }

    async fn stop_deployment(&self, deployment_id: &str) -> Result<bool, ConnectorError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state.stopped.push(deployment_id.to_string());
        if state.stop_ack {
            if let Some(deployment) = state.deployments.get_mut(deployment_id) {
                deployment.statuses = VecDeque::from([RemoteDeploymentStatus::Stopped]);
            }
        }
        Ok(state.stop_ack)
    }
}

/// Catalog entry helper for tests and the demo provider.
#[must_use]
pub fn mock_resource(provider: &str, resource_id: &str, hourly_rate: f64) -> Resource {
    Resource {
        provider: provider.to_string(),
        resource_id: resource_id.to_string(),
        gpu_type: "A100".to_string(),
        vram_gb: 80,
        hourly_rate,
        availability: Availability::High,
    }
}
