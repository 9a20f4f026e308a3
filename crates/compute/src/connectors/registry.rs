//! Provider name to connector lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::mock::MockConnector;
use super::polling::PollingConnector;
use super::serverless::ServerlessConnector;
use super::session::{SessionConnector, SshSession};
use super::traits::{Connector, ServingConnector};
use crate::config::{ConnectorKind, ProviderSettings};
use crate::credentials::CredentialStore;
use crate::error::{OrchestratorError, Result};
use crate::models::ConnectionHandle;

/// A registered provider, seen through both capability traits.
#[derive(Clone)]
pub struct ProviderHandle {
    /// Connector variant.
    pub kind: ConnectorKind,
    /// Training-job capabilities.
    pub jobs: Arc<dyn Connector>,
    /// Serving capabilities.
    pub serving: Arc<dyn ServingConnector>,
}

/// Connectors by provider name.
///
/// This is the only place that looks at [`ConnectorKind`]; everything
/// downstream works against the traits.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    providers: BTreeMap<String, ProviderHandle>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.providers.iter().map(|(name, h)| (name, h.kind)))
            .finish()
    }
}

impl ConnectorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector that implements both capability traits.
    pub fn register<C>(&mut self, name: impl Into<String>, kind: ConnectorKind, connector: Arc<C>)
    where
        C: Connector + ServingConnector + 'static,
    {
        let name = name.into();
        info!(provider = %name, kind = %kind, "Registered connector");
        self.providers.insert(
            name,
            ProviderHandle {
                kind,
                jobs: connector.clone(),
                serving: connector,
            },
        );
    }

    /// Build connectors for every configured provider.
    ///
    /// # Errors
    /// Returns `Config` when a provider entry lacks a field its kind needs.
    pub fn from_settings(providers: &[ProviderSettings]) -> Result<Self> {
        let mut registry = Self::new();
        for settings in providers {
            registry.add_from_settings(settings)?;
        }
        Ok(registry)
    }

    fn add_from_settings(&mut self, settings: &ProviderSettings) -> Result<()> {
        let name = settings.name.clone();
        let base_url = || {
            settings.base_url.clone().ok_or_else(|| {
                OrchestratorError::Config(format!("provider `{name}` needs base_url"))
            })
        };

        match settings.kind {
            ConnectorKind::Polling => {
                let connector = PollingConnector::new(&name, base_url()?)?;
                self.register(name.clone(), settings.kind, Arc::new(connector));
            }
            ConnectorKind::Session => {
                let session = Arc::new(SshSession::new(settings.ssh_key_path.clone()));
                let mut connector = SessionConnector::new(&name, base_url()?, session)?;
                if let Some(project) = &settings.project {
                    connector = connector.with_project(project);
                }
                if let Some(user) = &settings.ssh_user {
                    connector = connector.with_default_user(user);
                }
                self.register(name.clone(), settings.kind, Arc::new(connector));
            }
            ConnectorKind::Serverless => {
                let function = settings.function.clone().ok_or_else(|| {
                    OrchestratorError::Config(format!("provider `{name}` needs function"))
                })?;
                let connector = ServerlessConnector::new(&name, base_url()?, function)?;
                self.register(name.clone(), settings.kind, Arc::new(connector));
            }
            ConnectorKind::Mock => {
                self.register(name.clone(), settings.kind, Arc::new(MockConnector::new(&name)));
            }
        }
        Ok(())
    }

    /// Training-job connector for `provider`.
    ///
    /// # Errors
    /// Returns `UnknownProvider` if nothing is registered under that name.
    pub fn jobs(&self, provider: &str) -> Result<Arc<dyn Connector>> {
        self.providers
            .get(provider)
            .map(|h| h.jobs.clone())
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.to_string()))
    }

    /// Serving connector for `provider`.
    ///
    /// # Errors
    /// Returns `UnknownProvider` if nothing is registered under that name.
    pub fn serving(&self, provider: &str) -> Result<Arc<dyn ServingConnector>> {
        self.providers
            .get(provider)
            .map(|h| h.serving.clone())
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.to_string()))
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Whether no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Authenticate one provider with secrets from `credentials`.
    ///
    /// # Errors
    /// Returns `UnknownProvider`, a credential store error, or the
    /// connector's own error.
    pub async fn connect(
        &self,
        provider: &str,
        credentials: &dyn CredentialStore,
    ) -> Result<ConnectionHandle> {
        let connector = self.jobs(provider)?;
        let secrets = credentials.get_credentials(provider).await?;
        Ok(connector.connect(&secrets).await?)
    }

    /// Authenticate every provider; failures are logged and skipped.
    pub async fn connect_all(&self, credentials: &dyn CredentialStore) -> Vec<ConnectionHandle> {
        let mut handles = Vec::new();
        for name in self.providers.keys() {
            match self.connect(name, credentials).await {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(provider = %name, error = %e, "Failed to connect provider"),
            }
        }
        handles
    }
}
