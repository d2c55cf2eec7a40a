//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with admin routes and the protected application
//! - Wire up middleware (request ID, tracing, timeout, protection gate)
//! - Bind server to listener with peer addresses available to the gate
//! - Run background upkeep (rate window cleanup, config reloads)
//! - Stop on the shutdown broadcast

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;

use crate::admin::setup_admin_router;
use crate::config::{AdminConfig, ProtectorConfig};
use crate::http::middleware::protection_middleware;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, trace_layer};
use crate::http::response::error_response;
use crate::observability::metrics;
use crate::security::gate::RequestGate;

/// Application state injected into the middleware and admin handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<RequestGate>,
    pub admin: AdminConfig,
}

/// Put `app` behind the protector.
///
/// Admin routes are merged in (when enabled) before the gate layer, so they
/// get no bypass.
#[allow(deprecated)]
pub fn protect(app: Router, state: AppState, request_timeout: Duration) -> Router {
    let app = if state.admin.enabled {
        app.merge(setup_admin_router(state.clone()))
    } else {
        app
    };

    app.layer(middleware::from_fn_with_state(state, protection_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(propagate_request_id_layer())
        .layer(trace_layer())
        .layer(set_request_id_layer())
}

/// Stand-in application served by the binary when none is supplied.
pub fn default_application() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "No such route")
}

/// HTTP server for the protector.
pub struct HttpServer {
    router: Router,
    config: ProtectorConfig,
    gate: Arc<RequestGate>,
}

impl HttpServer {
    /// Serve the default application behind the gate.
    pub fn new(config: ProtectorConfig, gate: Arc<RequestGate>) -> Self {
        Self::with_application(config, gate, default_application())
    }

    /// Serve `app` behind the gate.
    pub fn with_application(config: ProtectorConfig, gate: Arc<RequestGate>, app: Router) -> Self {
        let state = AppState {
            gate: gate.clone(),
            admin: config.admin.clone(),
        };
        let router = protect(app, state, Duration::from_secs(config.request_timeout_secs));
        Self { router, config, gate }
    }

    /// Run the server until `shutdown` fires.
    ///
    /// Background tasks are stopped and awaited before returning, so every
    /// reference to the gate held here is gone afterwards.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: Option<mpsc::UnboundedReceiver<ProtectorConfig>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let mut tasks = Vec::new();
        if self.config.rate_limit.enabled {
            tasks.push(spawn_window_cleanup(
                self.gate.clone(),
                Duration::from_secs(self.config.rate_limit.cleanup_interval_secs),
            ));
        }
        if let Some(updates) = config_updates {
            tasks.push(spawn_reloader(self.gate.clone(), updates));
        }

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        served?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProtectorConfig {
        &self.config
    }
}

fn spawn_window_cleanup(gate: Arc<RequestGate>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick is immediate
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = gate.rate().cleanup();
            let active = gate.rate().active_identities();
            metrics::set_active_identities(active);
            if removed > 0 {
                tracing::debug!(removed, active, "Expired rate windows removed");
            }
        }
    })
}

fn spawn_reloader(gate: Arc<RequestGate>, mut updates: mpsc::UnboundedReceiver<ProtectorConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(config) = updates.recv().await {
            match gate.apply_reload(&config) {
                Ok(()) => tracing::info!("Reloaded configuration applied"),
                Err(e) => tracing::error!(error = %e, "Reload rejected; keeping current configuration"),
            }
        }
    })
}
