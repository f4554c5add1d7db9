//! `/metrics` and `/health` over HTTP.
//!
//! The capture pipeline is thread-based, so the server runs on its own
//! thread with a private single-worker runtime and shares the registry
//! the main loop updates.

use crate::metrics::MetricsRegistry;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tower_http::cors::CorsLayer;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors from starting or running the exporter.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind metrics listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("metrics server stopped: {0}")]
    Serve(String),
}

/// Prometheus exporter for a shared [`MetricsRegistry`].
pub struct MetricsServer {
    addr: SocketAddr,
    registry: Arc<MetricsRegistry>,
}

impl MetricsServer {
    /// Serves `registry` on all interfaces at `port`.
    pub fn on_port(port: u16, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            addr: ([0, 0, 0, 0], port).into(),
            registry,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.registry))
    }

    /// Serves until the listener fails.
    pub async fn serve(self) -> Result<(), ServerError> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "Metrics server listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))
    }

    /// Runs [`serve`](Self::serve) on a dedicated `metrics` thread.
    pub fn spawn(self) -> Result<thread::JoinHandle<()>, ServerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let handle = thread::Builder::new()
            .name("metrics".into())
            .spawn(move || {
                if let Err(error) = runtime.block_on(self.serve()) {
                    tracing::error!(%error, "Metrics server stopped");
                }
            })?;
        Ok(handle)
    }
}

fn render(registry: &MetricsRegistry) -> (StatusCode, [(&'static str, &'static str); 1], String) {
    match registry.encode() {
        Ok(body) => (StatusCode::OK, [("content-type", TEXT_FORMAT)], body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    render(&registry)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
