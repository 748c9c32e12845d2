//! Tool-server mesh: registry, pooled HTTP calls, response caching,
//! auth resolution, and the retry/circuit-breaker fan-out orchestrator.

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod registry;

pub use auth::{AuthResolver, EnvSecretStore, MemorySecretStore, SecretStore};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cache::ResponseCache;
pub use client::{CallOptions, ToolClient};
pub use error::{MeshError, Result};
pub use orchestrator::{
    FanOutOrchestrator, QueryOutcome, RetryPolicy, ServerFailure, ServerSuccess,
};
pub use pool::{ConnectionPool, PoolConfig};
pub use registry::{MetricsUpdate, ServerMetrics, ServerRegistry, ServerStatus};
