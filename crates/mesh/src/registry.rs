use crate::error::{MeshError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use toolmesh_protocol::ServerConfig;

/// Live health state for one server.
///
/// Last-call-weighted, not a running average: every attempt overwrites
/// `success_rate` with 1.0 or 0.0. Never persisted; rebuilt from runtime
/// observation only.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    pub response_time_ms: Option<u64>,
    pub success_rate: f64,
    pub last_successful_call: Option<SystemTime>,
    pub last_error: Option<String>,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerStatus {
    Up,
    Degraded,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            response_time_ms: None,
            success_rate: 1.0,
            last_successful_call: None,
            last_error: None,
            status: ServerStatus::Up,
        }
    }
}

/// Partial metrics update; merged field-by-field, last write wins.
#[derive(Debug, Default, Clone)]
pub struct MetricsUpdate {
    pub response_time_ms: Option<u64>,
    pub success_rate: Option<f64>,
    pub last_successful_call: Option<SystemTime>,
    pub last_error: Option<String>,
    pub status: Option<ServerStatus>,
}

struct ServerEntry {
    config: ServerConfig,
    metrics: ServerMetrics,
}

/// Holds registered server configs plus their live metrics and selects
/// servers for capabilities. No I/O; safe to share across fan-out
/// branches (internally synchronized, nothing awaits while locked).
#[derive(Default)]
pub struct ServerRegistry {
    servers: Mutex<HashMap<String, ServerEntry>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert: config is replaced wholesale, existing metrics
    /// survive re-registration.
    pub fn register(&self, config: ServerConfig) {
        let mut servers = self.lock();
        match servers.get_mut(&config.id) {
            Some(entry) => {
                log::debug!("re-registering server {}", config.id);
                entry.config = config;
            }
            None => {
                log::info!("registered server {} ({})", config.id, config.endpoint);
                servers.insert(
                    config.id.clone(),
                    ServerEntry {
                        config,
                        metrics: ServerMetrics::default(),
                    },
                );
            }
        }
    }

    /// Merge a partial metrics update into the server's metrics.
    pub fn update_metrics(&self, server_id: &str, update: MetricsUpdate) -> Result<()> {
        let mut servers = self.lock();
        let entry = servers
            .get_mut(server_id)
            .ok_or_else(|| MeshError::ServerNotFound(server_id.to_string()))?;
        let metrics = &mut entry.metrics;
        if let Some(ms) = update.response_time_ms {
            metrics.response_time_ms = Some(ms);
        }
        if let Some(rate) = update.success_rate {
            metrics.success_rate = rate;
        }
        if let Some(at) = update.last_successful_call {
            metrics.last_successful_call = Some(at);
        }
        if let Some(err) = update.last_error {
            metrics.last_error = Some(err);
        }
        if let Some(status) = update.status {
            metrics.status = status;
        }
        Ok(())
    }

    /// Record the outcome of a successful call attempt.
    pub fn record_success(&self, server_id: &str, elapsed: Duration) {
        let update = MetricsUpdate {
            response_time_ms: Some(elapsed.as_millis() as u64),
            success_rate: Some(1.0),
            last_successful_call: Some(SystemTime::now()),
            status: Some(ServerStatus::Up),
            ..Default::default()
        };
        if let Err(err) = self.update_metrics(server_id, update) {
            log::warn!("metrics update for {server_id} failed: {err}");
        }
    }

    /// Record the outcome of a failed call attempt.
    pub fn record_failure(&self, server_id: &str, message: &str) {
        let update = MetricsUpdate {
            success_rate: Some(0.0),
            last_error: Some(message.to_string()),
            status: Some(ServerStatus::Degraded),
            ..Default::default()
        };
        if let Err(err) = self.update_metrics(server_id, update) {
            log::warn!("metrics update for {server_id} failed: {err}");
        }
    }

    pub fn get(&self, server_id: &str) -> Option<ServerConfig> {
        self.lock().get(server_id).map(|e| e.config.clone())
    }

    pub fn metrics(&self, server_id: &str) -> Option<ServerMetrics> {
        self.lock().get(server_id).map(|e| e.metrics.clone())
    }

    /// Best healthy server for a capability: highest priority wins, ties
    /// broken by ascending id so selection is deterministic.
    pub fn find_best_server(&self, capability: &str) -> Option<ServerConfig> {
        let servers = self.lock();
        servers
            .values()
            .filter(|e| Self::eligible(e, capability))
            .max_by(|a, b| {
                a.config
                    .priority
                    .cmp(&b.config.priority)
                    .then_with(|| b.config.id.cmp(&a.config.id))
            })
            .map(|e| e.config.clone())
    }

    /// Every server advertising the capability, ordered by descending
    /// priority (id ascending within a priority). Degraded servers stay
    /// candidates here: fan-out gates each one behind its circuit
    /// breaker, which is also the only path that can revive them with
    /// a trial call.
    pub fn find_servers_by_capability(&self, capability: &str) -> Vec<ServerConfig> {
        let servers = self.lock();
        let mut found: Vec<ServerConfig> = servers
            .values()
            .filter(|e| e.config.capabilities.contains(capability))
            .map(|e| e.config.clone())
            .collect();
        found.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        found
    }

    /// All servers with their metrics, for status display.
    pub fn list_servers(&self) -> Vec<(ServerConfig, ServerMetrics)> {
        let servers = self.lock();
        let mut all: Vec<_> = servers
            .values()
            .map(|e| (e.config.clone(), e.metrics.clone()))
            .collect();
        all.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        all
    }

    fn eligible(entry: &ServerEntry, capability: &str) -> bool {
        entry.metrics.status == ServerStatus::Up
            && entry.config.capabilities.contains(capability)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServerEntry>> {
        self.servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
