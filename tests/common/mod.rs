//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use network_protector::config::{PatternSpec, ProtectorConfig};
use network_protector::http::server::default_application;
use network_protector::persistence::PersistenceHandle;
use network_protector::{protect, AppState, HttpServer, RequestGate, Shutdown};

pub const OPERATOR: &str = "10.0.0.1:40000";
pub const CLIENT: &str = "198.51.100.20:50000";

/// Allow-lists the operator, three requests per window, traversal signature.
pub fn test_config() -> ProtectorConfig {
    let mut config = ProtectorConfig::default();
    config.allowed_identities = vec!["10.0.0.1".into()];
    config.rate_limit.max_requests = 3;
    config.threat_detection.patterns = vec![PatternSpec::Categorized {
        pattern: r"\.\./".into(),
        category: "path_traversal".into(),
    }];
    config
}

pub fn gate(config: &ProtectorConfig) -> Arc<RequestGate> {
    Arc::new(RequestGate::from_config(config, PersistenceHandle::memory_only()).unwrap())
}

pub fn router(config: &ProtectorConfig, gate: Arc<RequestGate>) -> Router {
    let state = AppState {
        gate,
        admin: config.admin.clone(),
    };
    protect(default_application(), state, Duration::from_secs(config.request_timeout_secs))
}

/// Gate plus protected router over the default application.
pub fn app(config: &ProtectorConfig) -> (Router, Arc<RequestGate>) {
    let gate = gate(config);
    (router(config, gate.clone()), gate)
}

pub fn peer(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn with_token(mut request: Request<Body>, token: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert("authorization", format!("Bearer {token}").parse().unwrap());
    request
}

/// Drive one request through `router` as if it arrived from `from`.
pub async fn send(router: &Router, from: &str, mut request: Request<Body>) -> (StatusCode, Value) {
    request.extensions_mut().insert(ConnectInfo(peer(from)));
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

/// A running protector on an ephemeral port.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), std::io::Error>>,
}

impl RunningServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

pub async fn start_server(config: ProtectorConfig, gate: Arc<RequestGate>) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();

    let server = HttpServer::new(config, gate);
    let handle = tokio::spawn(async move { server.run(listener, None, rx).await });

    RunningServer { addr, shutdown, handle }
}
