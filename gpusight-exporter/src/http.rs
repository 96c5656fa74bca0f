//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

/// Latest pipeline output, as served on the metrics endpoint.
#[derive(Debug, Default)]
pub struct MetricsStore {
    latest: RwLock<String>,
    payloads: AtomicU64,
}

/// Shareable store handle.
pub type SharedStore = Arc<MetricsStore>;

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the served payload.
    ///
    /// An empty payload clears the endpoint: a failed cycle must not leave
    /// stale readings behind.
    pub fn update(&self, payload: String) {
        *self.latest.write() = payload;
        self.payloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Current payload.
    pub fn render(&self) -> String {
        self.latest.read().clone()
    }

    /// Number of payloads received so far.
    pub fn payloads_received(&self) -> u64 {
        self.payloads.load(Ordering::Relaxed)
    }

    /// Store every payload from the pipeline until it closes the channel.
    pub async fn consume(self: Arc<Self>, mut payloads: mpsc::Receiver<String>) {
        while let Some(payload) = payloads.recv().await {
            debug!(bytes = payload.len(), "Received metrics payload");
            self.update(payload);
        }
        debug!("Pipeline output closed");
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: SharedStore,
}

/// Create the HTTP router.
fn create_router(store: SharedStore, metrics_path: &str) -> Router {
    let state = AppState { store };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.store.render();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.store.payloads_received() > 0 {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no metrics collected yet\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    store: SharedStore,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(store: SharedStore, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            store,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.store, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
