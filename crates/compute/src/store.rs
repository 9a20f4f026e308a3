//! Persistence for jobs, deployments and metric samples.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! embedding, and [`FileStore`], which keeps one JSON document per record
//! and an append-only JSON-lines file of samples per deployment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::models::{Deployment, DeploymentId, DeploymentStatus, Job, JobId, JobStatus, MetricSample};

/// CRUD contract the orchestrator and deployment manager rely on.
///
/// Updates to a record already terminal in the store fail with
/// `Archived`: finished jobs and deployments are read-only.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new job.
    async fn create_job(&self, job: &Job) -> Result<()>;
    /// Replace an existing job.
    async fn update_job(&self, job: &Job) -> Result<()>;
    /// Fetch a job.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;
    /// Jobs in any of the given statuses (all jobs when empty), oldest first.
    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>>;
    /// Find the job submitted with an idempotency key.
    async fn job_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// Insert a new deployment.
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;
    /// Replace an existing deployment.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;
    /// Fetch a deployment.
    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>>;
    /// Deployments in any of the given statuses (all when empty), oldest first.
    async fn deployments_by_status(&self, statuses: &[DeploymentStatus])
        -> Result<Vec<Deployment>>;

    /// Append samples for a deployment.
    async fn append_samples(&self, deployment: &DeploymentId, samples: &[MetricSample])
        -> Result<()>;
    /// All samples for a deployment in append order.
    async fn load_samples(&self, deployment: &DeploymentId) -> Result<Vec<MetricSample>>;
}

fn check_job_update(existing: Option<&Job>, job: &Job) -> Result<()> {
    match existing {
        None => Err(OrchestratorError::JobNotFound(job.id.to_string())),
        Some(current) if current.status.is_terminal() => {
            Err(OrchestratorError::Archived(job.id.to_string()))
        }
        Some(_) => Ok(()),
    }
}

fn check_deployment_update(existing: Option<&Deployment>, dep: &Deployment) -> Result<()> {
    match existing {
        None => Err(OrchestratorError::DeploymentNotFound(dep.id.to_string())),
        Some(current) if current.status.is_terminal() => {
            Err(OrchestratorError::Archived(dep.id.to_string()))
        }
        Some(_) => Ok(()),
    }
}

fn poisoned() -> OrchestratorError {
    OrchestratorError::Config("store lock poisoned".into())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    deployments: RwLock<HashMap<DeploymentId, Deployment>>,
    samples: RwLock<HashMap<DeploymentId, Vec<MetricSample>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs
            .write()
            .map_err(|_| poisoned())?
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        check_job_update(jobs.get(&job.id), job)?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let mut out: Vec<Job> = self
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|j| statuses.is_empty() || statuses.contains(&j.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn job_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .values()
            .find(|j| j.idempotency_key == key)
            .cloned())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.deployments
            .write()
            .map_err(|_| poisoned())?
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut deployments = self.deployments.write().map_err(|_| poisoned())?;
        check_deployment_update(deployments.get(&deployment.id), deployment)?;
        deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>> {
        Ok(self
            .deployments
            .read()
            .map_err(|_| poisoned())?
            .get(id)
            .cloned())
    }

    async fn deployments_by_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> Result<Vec<Deployment>> {
        let mut out: Vec<Deployment> = self
            .deployments
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|d| statuses.is_empty() || statuses.contains(&d.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn append_samples(
        &self,
        deployment: &DeploymentId,
        samples: &[MetricSample],
    ) -> Result<()> {
        self.samples
            .write()
            .map_err(|_| poisoned())?
            .entry(deployment.clone())
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }

    async fn load_samples(&self, deployment: &DeploymentId) -> Result<Vec<MetricSample>> {
        Ok(self
            .samples
            .read()
            .map_err(|_| poisoned())?
            .get(deployment)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// JSON files under a state directory:
///
/// ```text
/// <root>/jobs/<job_id>.json
/// <root>/deployments/<deployment_id>.json
/// <root>/metrics/<deployment_id>.jsonl
/// ```
///
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if the directories cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["jobs", "deployments", "metrics"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    fn job_path(&self, id: &JobId) -> PathBuf {
        self.root.join("jobs").join(format!("{id}.json"))
    }

    fn deployment_path(&self, id: &DeploymentId) -> PathBuf {
        self.root.join("deployments").join(format!("{id}.json"))
    }

    fn samples_path(&self, id: &DeploymentId) -> PathBuf {
        self.root.join("metrics").join(format!("{id}.jsonl"))
    }

    async fn write_json<T: serde::Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Wrote record");
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(value) = Self::read_json(&path).await? {
                out.push(value);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        Self::write_json(&self.job_path(&job.id), job).await
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let path = self.job_path(&job.id);
        let existing: Option<Job> = Self::read_json(&path).await?;
        check_job_update(existing.as_ref(), job)?;
        Self::write_json(&path, job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Self::read_json(&self.job_path(id)).await
    }

    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = Self::read_dir_json(&self.root.join("jobs")).await?;
        jobs.retain(|j| statuses.is_empty() || statuses.contains(&j.status));
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn job_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let jobs: Vec<Job> = Self::read_dir_json(&self.root.join("jobs")).await?;
        Ok(jobs.into_iter().find(|j| j.idempotency_key == key))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        Self::write_json(&self.deployment_path(&deployment.id), deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        let path = self.deployment_path(&deployment.id);
        let existing: Option<Deployment> = Self::read_json(&path).await?;
        check_deployment_update(existing.as_ref(), deployment)?;
        Self::write_json(&path, deployment).await
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>> {
        Self::read_json(&self.deployment_path(id)).await
    }

    async fn deployments_by_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> Result<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> =
            Self::read_dir_json(&self.root.join("deployments")).await?;
        deployments.retain(|d| statuses.is_empty() || statuses.contains(&d.status));
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(deployments)
    }

    async fn append_samples(
        &self,
        deployment: &DeploymentId,
        samples: &[MetricSample],
    ) -> Result<()> {
        let mut buf = Vec::new();
        for sample in samples {
            serde_json::to_writer(&mut buf, sample)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.samples_path(deployment))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_samples(&self, deployment: &DeploymentId) -> Result<Vec<MetricSample>> {
        let content = match tokio::fs::read_to_string(self.samples_path(deployment)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(OrchestratorError::from))
            .collect()
    }
}
