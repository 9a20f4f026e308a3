//! Registry of deployments currently serving traffic.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::models::{Deployment, DeploymentId, DeploymentStatus};
use crate::store::Store;

/// Routing view of one active deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveEndpoint {
    /// Local deployment ID.
    pub id: DeploymentId,
    /// Provider name.
    pub platform: String,
    /// Endpoint name from the config.
    pub name: String,
    /// Public URL.
    pub endpoint_url: String,
    /// Provider-side deployment ID.
    pub remote_id: Option<String>,
}

impl ActiveEndpoint {
    fn from_deployment(deployment: &Deployment) -> Option<Self> {
        let endpoint_url = deployment.endpoint_url.clone()?;
        Some(Self {
            id: deployment.id.clone(),
            platform: deployment.platform.clone(),
            name: deployment.config.name.clone(),
            endpoint_url,
            remote_id: deployment.remote_id.clone(),
        })
    }
}

/// Deployments in `Active`, owned by the deployment manager.
///
/// Filled from the store at startup and updated under the deployment's
/// lock each time it enters, changes endpoint in, or leaves `Active`.
#[derive(Debug, Default)]
pub struct ActiveDeployments {
    entries: RwLock<BTreeMap<DeploymentId, ActiveEndpoint>>,
}

impl ActiveDeployments {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the active deployments in `store`.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn load_from(&self, store: &dyn Store) -> Result<usize> {
        let active = store
            .deployments_by_status(&[DeploymentStatus::Active])
            .await?;
        let loaded: BTreeMap<_, _> = active
            .iter()
            .filter_map(ActiveEndpoint::from_deployment)
            .map(|e| (e.id.clone(), e))
            .collect();
        let count = loaded.len();

        if let Ok(mut entries) = self.entries.write() {
            *entries = loaded;
        }
        debug!(count, "Loaded active deployments");
        Ok(count)
    }

    /// Track or refresh a deployment; ignored unless it is `Active`.
    pub fn upsert(&self, deployment: &Deployment) {
        if deployment.status != DeploymentStatus::Active {
            return;
        }
        if let (Some(entry), Ok(mut entries)) = (
            ActiveEndpoint::from_deployment(deployment),
            self.entries.write(),
        ) {
            entries.insert(entry.id.clone(), entry);
        }
    }

    /// Stop tracking a deployment.
    pub fn remove(&self, id: &DeploymentId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(id);
        }
    }

    /// Look up one deployment.
    #[must_use]
    pub fn get(&self, id: &DeploymentId) -> Option<ActiveEndpoint> {
        self.entries.read().ok()?.get(id).cloned()
    }

    /// All active deployments ordered by ID.
    #[must_use]
    pub fn list(&self) -> Vec<ActiveEndpoint> {
        self.entries
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of active deployments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    /// Whether nothing is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
