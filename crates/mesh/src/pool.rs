use crate::error::{MeshError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Knobs for the per-endpoint HTTP clients.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Upper bound on one request, connect included. A hung remote call
    /// surfaces as a transient failure instead of stalling its retry
    /// cycle forever.
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 8,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One persistent, keep-alive HTTP client per unique endpoint, created
/// lazily and reused. Amortizes connection setup only; retries and
/// protocol handling live elsewhere.
pub struct ConnectionPool {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// The pooled client for an endpoint, building it on first use.
    pub fn client_for(&self, endpoint: &str) -> Result<reqwest::Client> {
        let mut clients = self.lock();
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .pool_idle_timeout(self.config.idle_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|err| MeshError::Pool(err.to_string()))?;

        log::debug!("created connection pool for {endpoint}");
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    /// Release every pooled client. Used at shutdown.
    pub fn close_all(&self) {
        let mut clients = self.lock();
        let count = clients.len();
        clients.clear();
        log::info!("closed {count} connection pools");
    }

    pub fn pool_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, reqwest::Client>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
