use crate::error::{MeshError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use toolmesh_protocol::{AuthConfig, AuthStrategy, DEFAULT_AUTH_HEADER, DEFAULT_AUTH_PREFIX};

/// External secret source consumed by the api-key strategy.
///
/// Looked up on every call so secret rotation is observed; resolved
/// values are never cached.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> std::result::Result<Option<String>, String>;
}

/// Secret store backed by process environment variables.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> std::result::Result<Option<String>, String> {
        Ok(std::env::var(name).ok())
    }
}

/// In-memory secret store for tests and embedding callers.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> std::result::Result<Option<String>, String> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// Maps a server's declared auth strategy to concrete request headers.
pub struct AuthResolver {
    secrets: Arc<dyn SecretStore>,
}

impl AuthResolver {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    /// Resolve the headers for one call. Pure function of the config
    /// plus one secret lookup.
    pub async fn get_headers(&self, auth: &AuthConfig) -> Result<HashMap<String, String>> {
        match auth.strategy {
            AuthStrategy::None => Ok(HashMap::new()),
            AuthStrategy::ApiKey => self.api_key_headers(auth).await,
            AuthStrategy::Unknown => {
                Err(MeshError::UnsupportedStrategy("unknown".to_string()))
            }
        }
    }

    async fn api_key_headers(&self, auth: &AuthConfig) -> Result<HashMap<String, String>> {
        let secret_name = auth.secret_key_name.as_deref().ok_or_else(|| {
            MeshError::AuthMisconfigured(
                "api-key strategy requires secretKeyName".to_string(),
            )
        })?;

        let secret = self
            .secrets
            .get_secret(secret_name)
            .await
            .map_err(MeshError::SecretStore)?
            .ok_or_else(|| MeshError::SecretNotFound(secret_name.to_string()))?;

        let header = auth
            .header_name
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string());
        let prefix = auth
            .header_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTH_PREFIX.to_string());

        let mut headers = HashMap::new();
        headers.insert(header, format!("{prefix}{secret}"));
        Ok(headers)
    }
}
