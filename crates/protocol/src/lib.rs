use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const PROTOCOL_VERSION: u32 = 1;

/// Default header used by the api-key auth strategy.
pub const DEFAULT_AUTH_HEADER: &str = "Authorization";

/// Default value prefix used by the api-key auth strategy.
pub const DEFAULT_AUTH_PREFIX: &str = "Bearer ";

/// Static configuration for one registered tool server.
///
/// Immutable once registered; re-registering the same id replaces the
/// whole config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    /// Base URL; calls go to `{endpoint}/mcp/call/{capability}`.
    pub endpoint: String,
    /// Capabilities this server advertises.
    pub capabilities: HashSet<String>,
    /// Higher priority wins when several servers offer a capability.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// How to authenticate against a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub strategy: AuthStrategy,
    /// Name of the secret to fetch for the api-key strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_name: Option<String>,
    /// Header to carry the credential; defaults to `Authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Prefix prepended to the secret value; defaults to `Bearer `.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStrategy {
    #[default]
    None,
    ApiKey,
    /// Anything we do not recognize; rejected at resolution time.
    #[serde(other)]
    Unknown,
}

/// Request body for `POST {endpoint}/mcp/call/{capability}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub params: serde_json::Value,
}

/// Success response body: `{"result": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallErrorBody {
    pub message: String,
}

/// A qualifying fan-out response forwarded to the knowledge graph as a
/// `(MCPServer)-[:PROVIDES]->(Response)-[:ENRICHES]->(KnowledgeNode)`
/// triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// Fresh identifier minted for this response.
    pub response_id: String,
    pub server_id: String,
    pub capability: String,
    /// Which knowledge field qualified the payload (e.g. `documentation`).
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Sink for knowledge-bearing fan-out responses. Writes are best-effort:
/// callers log failures and never fail the originating query on them.
#[async_trait::async_trait]
pub trait KnowledgeSink: Send + Sync {
    async fn record_response(&self, record: KnowledgeRecord) -> Result<(), String>;
}

/// A sink that drops every record; used where no graph store is wired in.
pub struct NullKnowledgeSink;

#[async_trait::async_trait]
impl KnowledgeSink for NullKnowledgeSink {
    async fn record_response(&self, _record: KnowledgeRecord) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_server_config_roundtrip() {
        let json = r#"{
            "id": "server1",
            "name": "Docs",
            "endpoint": "http://localhost:9090",
            "capabilities": ["doc", "search"],
            "priority": 100,
            "auth": {"strategy": "api-key", "secretKeyName": "DOCS_KEY"}
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.id, "server1");
        assert_eq!(config.priority, 100);
        assert!(config.capabilities.contains("doc"));
        assert_eq!(config.auth.strategy, AuthStrategy::ApiKey);
        assert_eq!(config.auth.secret_key_name.as_deref(), Some("DOCS_KEY"));

        let back = serde_json::to_value(&config).unwrap();
        let again: ServerConfig = serde_json::from_value(back).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_auth_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"id": "s", "name": "s", "endpoint": "http://x", "capabilities": []}"#,
        )
        .unwrap();
        assert_eq!(config.auth.strategy, AuthStrategy::None);
        assert_eq!(config.priority, 0);
    }

    #[test]
    fn test_call_response_shapes() {
        let ok: CallResponse = serde_json::from_str(r#"{"result": {"x": 1}}"#).unwrap();
        assert!(ok.result.is_some());
        assert!(ok.error.is_none());

        let err: CallResponse =
            serde_json::from_str(r#"{"error": {"message": "boom"}}"#).unwrap();
        assert_eq!(err.error.unwrap().message, "boom");
    }
}
