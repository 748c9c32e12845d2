use crate::auth::AuthResolver;
use crate::cache::ResponseCache;
use crate::error::{MeshError, Result};
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use toolmesh_protocol::{CallRequest, CallResponse, ServerConfig};

/// Per-call options.
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    /// Skip the response cache for this call.
    pub force_refresh: bool,
    /// Pin the call to a specific server instead of health-based
    /// selection.
    pub server_id: Option<String>,
}

/// Executes one call against one tool server: cache check, auth,
/// pooled request, health-metric update, cache write.
pub struct ToolClient {
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ResponseCache>,
    auth: AuthResolver,
}

impl ToolClient {
    pub fn new(
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        cache: Arc<ResponseCache>,
        auth: AuthResolver,
    ) -> Self {
        Self {
            registry,
            pool,
            cache,
            auth,
        }
    }

    /// Call a capability. Every attempt that reaches the server, success
    /// or failure, updates its metrics exactly once; cache hits leave
    /// metrics alone.
    pub async fn call(
        &self,
        capability: &str,
        params: &Value,
        options: &CallOptions,
    ) -> Result<Value> {
        let server = self.resolve_server(capability, options)?;

        // A cache hit involves no server contact, so it must not touch
        // metrics; only a real successful call revives a degraded server.
        if !options.force_refresh {
            if let Some(cached) = self.cache.get(&server.id, capability, params) {
                return Ok(cached);
            }
        }

        let started = Instant::now();
        match self.execute(&server, capability, params).await {
            Ok(value) => {
                self.registry.record_success(&server.id, started.elapsed());
                self.cache
                    .set(&server.id, capability, params, value.clone());
                Ok(value)
            }
            Err(err) => {
                self.registry.record_failure(&server.id, &err.to_string());
                Err(err)
            }
        }
    }

    fn resolve_server(&self, capability: &str, options: &CallOptions) -> Result<ServerConfig> {
        match &options.server_id {
            Some(id) => self
                .registry
                .get(id)
                .ok_or_else(|| MeshError::ServerNotFound(id.clone())),
            None => self
                .registry
                .find_best_server(capability)
                .ok_or_else(|| MeshError::NoServerAvailable(capability.to_string())),
        }
    }

    async fn execute(
        &self,
        server: &ServerConfig,
        capability: &str,
        params: &Value,
    ) -> Result<Value> {
        let headers = self.auth.get_headers(&server.auth).await?;
        let client = self.pool.client_for(&server.endpoint)?;
        let url = format!(
            "{}/mcp/call/{}",
            server.endpoint.trim_end_matches('/'),
            capability
        );

        let mut request = client.post(&url).json(&CallRequest {
            params: params.clone(),
        });
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        log::debug!("calling {} on {}", capability, server.id);
        let response = request
            .send()
            .await
            .map_err(|err| MeshError::call_failed(&server.id, err.to_string()))?;

        let status = response.status();
        let body: CallResponse = match response.json().await {
            Ok(body) => body,
            Err(err) if status.is_success() => {
                return Err(MeshError::call_failed(
                    &server.id,
                    format!("invalid response body: {err}"),
                ));
            }
            Err(_) => {
                return Err(MeshError::call_failed(
                    &server.id,
                    format!("HTTP {status}"),
                ));
            }
        };

        if !status.is_success() {
            let message = body
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(MeshError::call_failed(&server.id, message));
        }

        body.result
            .ok_or_else(|| MeshError::MalformedResponse(server.id.clone()))
    }
}
