use thiserror::Error;

/// Result type for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors produced by the server mesh (registry, auth, client, fan-out)
#[derive(Error, Debug)]
pub enum MeshError {
    /// An explicitly requested server id is not registered
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// No healthy server advertises the capability
    #[error("no server available for capability: {0}")]
    NoServerAvailable(String),

    /// Auth config is missing a field its strategy requires
    #[error("auth misconfigured: {0}")]
    AuthMisconfigured(String),

    /// The secret store has no value under the configured name
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// Auth strategy we do not implement
    #[error("unsupported auth strategy: {0}")]
    UnsupportedStrategy(String),

    /// The secret store itself failed
    #[error("secret store error: {0}")]
    SecretStore(String),

    /// Building or fetching a pooled connection failed
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A single call attempt failed (transport, status, or server error)
    #[error("call to {server_id} failed: {message}")]
    CallFailed { server_id: String, message: String },

    /// 2xx response without a `result` field
    #[error("malformed response from {0}: missing result field")]
    MalformedResponse(String),

    /// The per-server breaker is rejecting calls
    #[error("circuit breaker is open for server {0}")]
    CircuitOpen(String),

    /// Retry budget exhausted for one server
    #[error("call to {server_id} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        server_id: String,
        attempts: u32,
        message: String,
    },
}

impl MeshError {
    pub fn call_failed(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CallFailed {
            server_id: server_id.into(),
            message: message.into(),
        }
    }
}
