use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use toolmesh_mesh::{
    AuthResolver, BreakerConfig, CallOptions, ConnectionPool, FanOutOrchestrator,
    MemorySecretStore, MeshError, ResponseCache, RetryPolicy, ServerRegistry, ServerStatus,
    ToolClient,
};
use toolmesh_protocol::{
    AuthConfig, AuthStrategy, KnowledgeRecord, KnowledgeSink, NullKnowledgeSink, ServerConfig,
};

#[derive(Clone)]
struct MockState {
    hits: Arc<AtomicUsize>,
    /// Response body and status returned for every call.
    reply: Arc<dyn Fn(&HeaderMap) -> (StatusCode, Value) + Send + Sync>,
}

async fn handle_call(State(state): State<MockState>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let (status, body) = (state.reply)(&headers);
    (status, Json(body))
}

/// Spin up a mock tool server; returns its endpoint URL and hit counter.
async fn mock_server(
    reply: impl Fn(&HeaderMap) -> (StatusCode, Value) + Send + Sync + 'static,
) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = MockState {
        hits: Arc::clone(&hits),
        reply: Arc::new(reply),
    };
    let app = Router::new()
        .route("/mcp/call/:capability", post(handle_call))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn server_config(id: &str, endpoint: &str, priority: i32, caps: &[&str]) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        name: id.to_string(),
        endpoint: endpoint.to_string(),
        capabilities: caps.iter().map(|c| c.to_string()).collect::<HashSet<_>>(),
        priority,
        auth: AuthConfig::default(),
    }
}

struct Mesh {
    registry: Arc<ServerRegistry>,
    client: Arc<ToolClient>,
}

impl Mesh {
    fn new(servers: Vec<ServerConfig>) -> Self {
        Self::with_secrets(servers, MemorySecretStore::new())
    }

    fn with_secrets(servers: Vec<ServerConfig>, secrets: MemorySecretStore) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        for server in servers {
            registry.register(server);
        }
        let client = Arc::new(ToolClient::new(
            Arc::clone(&registry),
            Arc::new(ConnectionPool::default()),
            Arc::new(ResponseCache::default()),
            AuthResolver::new(Arc::new(secrets)),
        ));
        Self { registry, client }
    }

    fn orchestrator(&self, threshold: u32, sink: Arc<dyn KnowledgeSink>) -> FanOutOrchestrator {
        FanOutOrchestrator::with_policies(
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
            },
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(300),
            },
            sink,
        )
    }
}

#[tokio::test]
async fn test_query_no_servers_is_empty_not_error() {
    let mesh = Mesh::new(vec![]);
    let orchestrator = mesh.orchestrator(5, Arc::new(NullKnowledgeSink));
    let outcome = orchestrator.query("doc", &json!({})).await;
    assert!(outcome.successful.is_empty());
    assert!(outcome.failed.is_empty());
}

#[tokio::test]
async fn test_fanout_two_servers_both_succeed() {
    let (ep1, _) = mock_server(|_| (StatusCode::OK, json!({"result": {"from": "one"}}))).await;
    let (ep2, _) = mock_server(|_| (StatusCode::OK, json!({"result": {"from": "two"}}))).await;

    let mesh = Mesh::new(vec![
        server_config("server1", &ep1, 100, &["doc"]),
        server_config("server2", &ep2, 90, &["doc"]),
    ]);
    let orchestrator = mesh.orchestrator(5, Arc::new(NullKnowledgeSink));

    let outcome = orchestrator.query("doc", &json!({})).await;
    assert_eq!(outcome.successful.len(), 2);
    assert!(outcome.failed.is_empty());
}

#[tokio::test]
async fn test_fanout_partial_failure_isolated() {
    let (ep1, _) = mock_server(|_| (StatusCode::OK, json!({"result": "ok"}))).await;
    let (ep2, _) = mock_server(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"message": "rejected"}}),
        )
    })
    .await;

    let mesh = Mesh::new(vec![
        server_config("server1", &ep1, 100, &["doc"]),
        server_config("server2", &ep2, 90, &["doc"]),
    ]);
    let orchestrator = mesh.orchestrator(10, Arc::new(NullKnowledgeSink));

    let outcome = orchestrator.query("doc", &json!({})).await;
    assert_eq!(outcome.successful.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].server_id, "server2");
    assert!(outcome.failed[0].error.contains("after 3 attempts"));
}

#[tokio::test]
async fn test_metrics_reflect_call_outcomes() {
    let (ep1, _) = mock_server(|_| (StatusCode::OK, json!({"result": "ok"}))).await;
    let (ep2, _) = mock_server(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"message": "rejected"}}),
        )
    })
    .await;

    let mesh = Mesh::new(vec![
        server_config("server1", &ep1, 100, &["doc"]),
        server_config("server2", &ep2, 90, &["doc"]),
    ]);
    let orchestrator = mesh.orchestrator(10, Arc::new(NullKnowledgeSink));
    orchestrator.query("doc", &json!({})).await;

    let good = mesh.registry.metrics("server1").unwrap();
    assert_eq!(good.status, ServerStatus::Up);
    assert_eq!(good.success_rate, 1.0);
    assert!(good.last_successful_call.is_some());

    let bad = mesh.registry.metrics("server2").unwrap();
    assert_eq!(bad.status, ServerStatus::Degraded);
    assert_eq!(bad.success_rate, 0.0);
    assert!(bad.last_error.as_deref().unwrap_or("").contains("rejected"));
}

#[tokio::test]
async fn test_degraded_server_excluded_from_best_selection() {
    let (ep, _) = mock_server(|_| (StatusCode::OK, json!({"result": "ok"}))).await;
    let mesh = Mesh::new(vec![
        server_config("server1", &ep, 100, &["doc"]),
        server_config("server2", &ep, 90, &["doc"]),
    ]);

    assert_eq!(mesh.registry.find_best_server("doc").unwrap().id, "server1");
    mesh.registry.record_failure("server1", "down");
    assert_eq!(mesh.registry.find_best_server("doc").unwrap().id, "server2");
}

#[tokio::test]
async fn test_circuit_breaker_short_circuits_without_transport() {
    let (ep, hits) = mock_server(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"message": "down"}}),
        )
    })
    .await;

    let mesh = Mesh::new(vec![server_config("server1", &ep, 100, &["doc"])]);
    // Threshold 1: the first failed attempt opens the breaker.
    let orchestrator = mesh.orchestrator(1, Arc::new(NullKnowledgeSink));

    let outcome = orchestrator.query("doc", &json!({})).await;
    assert_eq!(outcome.failed.len(), 1);
    let first_round_hits = hits.load(Ordering::SeqCst);
    assert_eq!(first_round_hits, 1);

    // Breaker is open: the next query must not touch the network.
    let outcome = orchestrator.query("doc", &json!({})).await;
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[0].error.contains("circuit breaker is open"));
    assert_eq!(hits.load(Ordering::SeqCst), first_round_hits);
}

#[tokio::test]
async fn test_response_cache_skips_transport_on_second_call() {
    let (ep, hits) = mock_server(|_| (StatusCode::OK, json!({"result": "cached"}))).await;
    let mesh = Mesh::new(vec![server_config("server1", &ep, 100, &["doc"])]);

    let params = json!({"a": 1, "b": 2});
    let first = mesh
        .client
        .call("doc", &params, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(first, json!("cached"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Same params, different key order: must hit the cache.
    let reordered = json!({"b": 2, "a": 1});
    let second = mesh
        .client
        .call("doc", &reordered, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(second, json!("cached"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // force_refresh bypasses the cache.
    mesh.client
        .call(
            "doc",
            &params,
            &CallOptions {
                force_refresh: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_explicit_unknown_server_fails() {
    let mesh = Mesh::new(vec![]);
    let err = mesh
        .client
        .call(
            "doc",
            &json!({}),
            &CallOptions {
                server_id: Some("ghost".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::ServerNotFound(_)));
}

#[tokio::test]
async fn test_missing_result_field_is_call_error() {
    let (ep, _) = mock_server(|_| (StatusCode::OK, json!({"unexpected": true}))).await;
    let mesh = Mesh::new(vec![server_config("server1", &ep, 100, &["doc"])]);
    let err = mesh
        .client
        .call("doc", &json!({}), &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::MalformedResponse(_)));

    let metrics = mesh.registry.metrics("server1").unwrap();
    assert_eq!(metrics.status, ServerStatus::Degraded);
}

#[tokio::test]
async fn test_api_key_auth_headers_sent() {
    let (ep, _) = mock_server(|headers| {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer k3y") => (StatusCode::OK, json!({"result": "authed"})),
            _ => (
                StatusCode::UNAUTHORIZED,
                json!({"error": {"message": "missing credentials"}}),
            ),
        }
    })
    .await;

    let mut config = server_config("server1", &ep, 100, &["doc"]);
    config.auth = AuthConfig {
        strategy: AuthStrategy::ApiKey,
        secret_key_name: Some("DOC_KEY".to_string()),
        ..Default::default()
    };
    let mesh = Mesh::with_secrets(
        vec![config],
        MemorySecretStore::new().with_secret("DOC_KEY", "k3y"),
    );

    let value = mesh
        .client
        .call("doc", &json!({}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!("authed"));
}

#[tokio::test]
async fn test_cache_hit_leaves_degraded_metrics_alone() {
    let (ep, hits) = mock_server(|_| (StatusCode::OK, json!({"result": "ok"}))).await;
    let mesh = Mesh::new(vec![server_config("server1", &ep, 100, &["doc"])]);

    let params = json!({"q": "frobnicate"});
    mesh.client
        .call("doc", &params, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    mesh.registry.record_failure("server1", "flaky");
    assert_eq!(
        mesh.registry.metrics("server1").unwrap().status,
        ServerStatus::Degraded
    );

    // Served from cache: no transport, and no metrics update either, so
    // the server stays degraded until a real call succeeds.
    mesh.client
        .call("doc", &params, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        mesh.registry.metrics("server1").unwrap().status,
        ServerStatus::Degraded
    );
}

#[tokio::test]
async fn test_missing_secret_fails_without_retries() {
    let (ep, hits) = mock_server(|_| (StatusCode::OK, json!({"result": "ok"}))).await;

    let mut config = server_config("server1", &ep, 100, &["doc"]);
    config.auth = AuthConfig {
        strategy: AuthStrategy::ApiKey,
        secret_key_name: Some("MISSING_KEY".to_string()),
        ..Default::default()
    };
    let mesh = Mesh::with_secrets(vec![config], MemorySecretStore::new());
    let orchestrator = mesh.orchestrator(5, Arc::new(NullKnowledgeSink));

    let outcome = orchestrator.query("doc", &json!({})).await;
    assert_eq!(outcome.failed.len(), 1);
    // The misconfiguration surfaces as-is, not wrapped in a
    // retries-exhausted error, and never reaches the transport.
    assert!(outcome.failed[0].error.contains("secret not found"));
    assert!(!outcome.failed[0].error.contains("attempts"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_query_with_force_refresh_bypasses_cache() {
    let (ep, hits) = mock_server(|_| (StatusCode::OK, json!({"result": "ok"}))).await;
    let mesh = Mesh::new(vec![server_config("server1", &ep, 100, &["doc"])]);
    let orchestrator = mesh.orchestrator(5, Arc::new(NullKnowledgeSink));

    let params = json!({"q": "docs"});
    orchestrator.query("doc", &params).await;
    orchestrator.query("doc", &params).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let outcome = orchestrator.query_with("doc", &params, true).await;
    assert_eq!(outcome.successful.len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

struct RecordingSink {
    records: tokio::sync::Mutex<Vec<KnowledgeRecord>>,
}

#[async_trait::async_trait]
impl KnowledgeSink for RecordingSink {
    async fn record_response(&self, record: KnowledgeRecord) -> Result<(), String> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

#[tokio::test]
async fn test_knowledge_responses_forwarded_to_sink() {
    let (ep, _) = mock_server(|_| {
        (
            StatusCode::OK,
            json!({"result": {"documentation": "how to frobnicate"}}),
        )
    })
    .await;
    let mesh = Mesh::new(vec![server_config("server1", &ep, 100, &["doc"])]);

    let sink = Arc::new(RecordingSink {
        records: tokio::sync::Mutex::new(Vec::new()),
    });
    let orchestrator = mesh.orchestrator(5, Arc::clone(&sink) as Arc<dyn KnowledgeSink>);

    let outcome = orchestrator.query("doc", &json!({})).await;
    assert_eq!(outcome.successful.len(), 1);

    // Forwarding is fire-and-forget; give the spawned task a moment.
    let mut forwarded = Vec::new();
    for _ in 0..50 {
        forwarded = sink.records.lock().await.clone();
        if !forwarded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].server_id, "server1");
    assert_eq!(forwarded[0].kind, "documentation");
    assert!(forwarded[0].response_id.starts_with("resp-"));
}
