use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::client::{CallOptions, ToolClient};
use crate::error::{MeshError, Result};
use crate::registry::ServerRegistry;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use toolmesh_protocol::{KnowledgeRecord, KnowledgeSink, NullKnowledgeSink};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Payload keys that mark a response as knowledge-bearing.
const KNOWLEDGE_KEYS: &[&str] = &["documentation", "docs", "knowledge"];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff doubles per attempt starting from this base.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSuccess {
    pub server_id: String,
    pub response: Value,
}

#[derive(Debug, Clone)]
pub struct ServerFailure {
    pub server_id: String,
    pub error: String,
}

/// Best-effort aggregation of one fan-out query. Partial failure is
/// the normal case, not an error.
#[derive(Debug, Default, Clone)]
pub struct QueryOutcome {
    pub successful: Vec<ServerSuccess>,
    pub failed: Vec<ServerFailure>,
}

/// Fans a capability query out to every server advertising it, each
/// call wrapped in retry + a per-server circuit breaker, and
/// aggregates the partitioned results.
pub struct FanOutOrchestrator {
    client: Arc<ToolClient>,
    registry: Arc<ServerRegistry>,
    retry: RetryPolicy,
    breaker_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    sink: Arc<dyn KnowledgeSink>,
}

impl FanOutOrchestrator {
    pub fn new(client: Arc<ToolClient>, registry: Arc<ServerRegistry>) -> Self {
        Self::with_policies(
            client,
            registry,
            RetryPolicy::default(),
            BreakerConfig::default(),
            Arc::new(NullKnowledgeSink),
        )
    }

    pub fn with_policies(
        client: Arc<ToolClient>,
        registry: Arc<ServerRegistry>,
        retry: RetryPolicy,
        breaker_config: BreakerConfig,
        sink: Arc<dyn KnowledgeSink>,
    ) -> Self {
        Self {
            client,
            registry,
            retry,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Query every candidate server concurrently. One server's failure
    /// never aborts the others; no servers at all yields empty lists.
    pub async fn query(&self, capability: &str, params: &Value) -> QueryOutcome {
        self.query_with(capability, params, false).await
    }

    /// Like [`query`](Self::query), with a per-call response-cache
    /// opt-out.
    pub async fn query_with(
        &self,
        capability: &str,
        params: &Value,
        force_refresh: bool,
    ) -> QueryOutcome {
        let candidates = self.registry.find_servers_by_capability(capability);
        if candidates.is_empty() {
            log::debug!("no servers advertise capability {capability}");
            return QueryOutcome::default();
        }

        let calls = candidates.iter().map(|server| {
            let server_id = server.id.clone();
            async move {
                let result = self
                    .call_with_retry(&server_id, capability, params, force_refresh)
                    .await;
                (server_id, result)
            }
        });

        let mut outcome = QueryOutcome::default();
        for (server_id, result) in futures::future::join_all(calls).await {
            match result {
                Ok(response) => {
                    self.forward_knowledge(&server_id, capability, &response);
                    outcome.successful.push(ServerSuccess {
                        server_id,
                        response,
                    });
                }
                Err(err) => {
                    log::warn!("fan-out call to {server_id} failed: {err}");
                    outcome.failed.push(ServerFailure {
                        server_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        log::info!(
            "fan-out {capability}: {} ok, {} failed",
            outcome.successful.len(),
            outcome.failed.len()
        );
        outcome
    }

    async fn call_with_retry(
        &self,
        server_id: &str,
        capability: &str,
        params: &Value,
        force_refresh: bool,
    ) -> Result<Value> {
        let breaker = self.breaker_for(server_id);
        let options = CallOptions {
            server_id: Some(server_id.to_string()),
            force_refresh,
        };

        let mut last_error: Option<MeshError> = None;
        for attempt in 0..self.retry.max_attempts {
            if !breaker.try_acquire() {
                return Err(MeshError::CircuitOpen(server_id.to_string()));
            }

            match self.client.call(capability, params, &options).await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    breaker.record_failure();
                    if !is_transient(&err) {
                        // Configuration errors will not heal with retries.
                        return Err(err);
                    }
                    log::debug!(
                        "attempt {}/{} against {server_id} failed: {err}",
                        attempt + 1,
                        self.retry.max_attempts
                    );
                    last_error = Some(err);
                }
            }

            if attempt + 1 < self.retry.max_attempts {
                let backoff = self.retry.base_backoff * 2u32.saturating_pow(attempt);
                tokio::time::sleep(backoff).await;
            }
        }

        let message = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(MeshError::RetriesExhausted {
            server_id: server_id.to_string(),
            attempts: self.retry.max_attempts,
            message,
        })
    }

    fn breaker_for(&self, server_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone())))
            .clone()
    }

    /// Forward a knowledge-bearing response to the graph store in the
    /// background. Write failures are logged and never fail the query.
    fn forward_knowledge(&self, server_id: &str, capability: &str, response: &Value) {
        let Some(kind) = knowledge_kind(response) else {
            return;
        };

        let record = KnowledgeRecord {
            response_id: fresh_response_id(server_id, capability),
            server_id: server_id.to_string(),
            capability: capability.to_string(),
            kind: kind.to_string(),
            payload: response.clone(),
        };

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(err) = sink.record_response(record).await {
                log::warn!("knowledge graph write failed: {err}");
            }
        });
    }
}

/// Whether an error class can heal with another attempt. Auth and
/// registry misconfiguration cannot; transport and server errors can.
fn is_transient(err: &MeshError) -> bool {
    !matches!(
        err,
        MeshError::AuthMisconfigured(_)
            | MeshError::SecretNotFound(_)
            | MeshError::UnsupportedStrategy(_)
            | MeshError::ServerNotFound(_)
            | MeshError::NoServerAvailable(_)
    )
}

/// Which knowledge field, if any, qualifies this payload for graph
/// enrichment.
fn knowledge_kind(response: &Value) -> Option<&'static str> {
    let object = response.as_object()?;
    KNOWLEDGE_KEYS
        .iter()
        .find(|key| object.contains_key(**key))
        .copied()
}

fn fresh_response_id(server_id: &str, capability: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(server_id.as_bytes());
    hasher.update(capability.as_bytes());
    hasher.update(nanos.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("resp-{hex}")
}
