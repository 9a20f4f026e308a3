//! Credential store contract.
//!
//! The orchestrator only ever holds a [`CredentialRef`]; secret material is
//! fetched from a [`CredentialStore`] right before `connect` and dropped
//! afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, OrchestratorError, Result};

/// Opaque pointer to a provider's credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Provider name.
    pub provider: String,
    /// Store-specific locator (env prefix, vault path, ...).
    pub reference: String,
}

/// Secret key/value pairs for one provider.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretBundle(BTreeMap<String, String>);

impl SecretBundle {
    /// Create an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up a value that must be present and non-empty.
    ///
    /// # Errors
    /// Returns `Auth` naming the missing key.
    pub fn require(&self, key: &str) -> Result<&str, ConnectorError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConnectorError::Auth(format!("missing credential field `{key}`")))
    }

    /// Whether the bundle has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

/// External credential storage.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the secrets for a provider.
    async fn get_credentials(&self, provider: &str) -> Result<SecretBundle>;

    /// Store or replace the secrets for a provider.
    async fn store_credentials(&self, provider: &str, secrets: SecretBundle) -> Result<()>;

    /// Reference handed to the rest of the system.
    fn reference(&self, provider: &str) -> CredentialRef;
}

/// Reads `<PROVIDER>_API_KEY` (and friends) from the process environment.
///
/// `store_credentials` keeps values in memory only, overriding the
/// environment for the lifetime of the process.
#[derive(Debug, Default)]
pub struct EnvCredentialStore {
    overrides: RwLock<HashMap<String, SecretBundle>>,
}

/// Fields looked up for each provider, as `<PREFIX>_<FIELD>`.
const ENV_FIELDS: &[&str] = &["API_KEY", "PROJECT_ID", "ACCOUNT_ID"];

impl EnvCredentialStore {
    /// Create a store backed by the process environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment prefix for a provider (`my-cloud` -> `MY_CLOUD`).
    #[must_use]
    pub fn env_prefix(provider: &str) -> String {
        provider
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get_credentials(&self, provider: &str) -> Result<SecretBundle> {
        if let Some(bundle) = self
            .overrides
            .read()
            .ok()
            .and_then(|o| o.get(provider).cloned())
        {
            return Ok(bundle);
        }

        let prefix = Self::env_prefix(provider);
        let mut bundle = SecretBundle::new();
        for field in ENV_FIELDS {
            if let Ok(value) = std::env::var(format!("{prefix}_{field}")) {
                bundle = bundle.with(field.to_ascii_lowercase(), value);
            }
        }
        Ok(bundle)
    }

    async fn store_credentials(&self, provider: &str, secrets: SecretBundle) -> Result<()> {
        let mut overrides = self
            .overrides
            .write()
            .map_err(|_| OrchestratorError::Config("credential store lock poisoned".into()))?;
        overrides.insert(provider.to_string(), secrets);
        Ok(())
    }

    fn reference(&self, provider: &str) -> CredentialRef {
        CredentialRef {
            provider: provider.to_string(),
            reference: format!("env:{}_*", Self::env_prefix(provider)),
        }
    }
}

/// In-memory store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    bundles: RwLock<HashMap<String, SecretBundle>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_credentials(&self, provider: &str) -> Result<SecretBundle> {
        self.bundles
            .read()
            .ok()
            .and_then(|b| b.get(provider).cloned())
            .ok_or_else(|| {
                OrchestratorError::Connector(ConnectorError::Auth(format!(
                    "no credentials stored for {provider}"
                )))
            })
    }

    async fn store_credentials(&self, provider: &str, secrets: SecretBundle) -> Result<()> {
        let mut bundles = self
            .bundles
            .write()
            .map_err(|_| OrchestratorError::Config("credential store lock poisoned".into()))?;
        bundles.insert(provider.to_string(), secrets);
        Ok(())
    }

    fn reference(&self, provider: &str) -> CredentialRef {
        CredentialRef {
            provider: provider.to_string(),
            reference: format!("memory:{provider}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_values() {
        let bundle = SecretBundle::new().with("api_key", "sk-very-secret");
        let printed = format!("{bundle:?}");
        assert!(printed.contains("api_key"));
        assert!(!printed.contains("sk-very-secret"));
    }

    #[test]
    fn test_require_missing_is_auth_error() {
        let bundle = SecretBundle::new().with("api_key", "");
        assert!(matches!(
            bundle.require("api_key"),
            Err(ConnectorError::Auth(_))
        ));
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(EnvCredentialStore::env_prefix("lambda-labs"), "LAMBDA_LABS");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        assert!(store.get_credentials("p").await.is_err());

        store
            .store_credentials("p", SecretBundle::new().with("api_key", "k"))
            .await
            .unwrap();
        let bundle = store.get_credentials("p").await.unwrap();
        assert_eq!(bundle.get("api_key"), Some("k"));
        assert_eq!(store.reference("p").reference, "memory:p");
    }

    #[tokio::test]
    async fn test_env_store_override() {
        let store = EnvCredentialStore::new();
        store
            .store_credentials(
                "unit-test-provider",
                SecretBundle::new().with("api_key", "override"),
            )
            .await
            .unwrap();
        let bundle = store.get_credentials("unit-test-provider").await.unwrap();
        assert_eq!(bundle.get("api_key"), Some("override"));
    }
}
