//! HTTP endpoint exposing the metrics snapshot and health probes.
//!
//! Routes:
//! - `GET /` -- static banner
//! - `GET /metrics` -- JSON snapshot of the request/event counters
//! - `GET /health/live` -- liveness probe
//! - `GET /health/ready` -- readiness probe, 200 only while running
//!
//! `start()` binds and spawns the server; `stop()` performs a graceful axum
//! shutdown and may be called any number of times.

pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::lifecycle::LifecycleState;
use crate::metrics::Metrics;
use handlers::{banner_handler, liveness_handler, metrics_handler, readiness_handler, AppState};
use middleware::build_http_layers;

pub use handlers::BANNER;

struct Running {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Metrics HTTP server with an explicit start/stop lifecycle.
pub struct MetricsServer {
    runtime: RuntimeConfig,
    port: u16,
    state: AppState,
    running: Mutex<Option<Running>>,
}

impl MetricsServer {
    /// Creates the server without binding. Host and HTTP tuning come from
    /// `runtime`.
    #[must_use]
    pub fn new(
        runtime: &RuntimeConfig,
        port: u16,
        metrics: Arc<Metrics>,
        lifecycle: Arc<ArcSwap<LifecycleState>>,
    ) -> Self {
        Self {
            runtime: runtime.clone(),
            port,
            state: AppState { metrics, lifecycle },
            running: Mutex::new(None),
        }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(banner_handler))
            .route("/metrics", get(metrics_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(build_http_layers(&self.runtime))
            .with_state(self.state.clone())
    }

    /// Binds the listener and starts serving in a background task.
    ///
    /// Returns the bound address, which carries the OS-assigned port when
    /// the configured port is 0. Calling `start` on a running server returns
    /// the existing address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind((self.runtime.metrics_host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.build_router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "metrics server terminated with error");
            }
        });

        info!(%addr, "metrics server listening");
        *self.running.lock() = Some(Running {
            addr,
            shutdown_tx,
            handle,
        });
        Ok(addr)
    }

    /// Address of the running server, if started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Stops the server and waits for it to finish. No-op if not running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            warn!(error = %e, "metrics server task failed");
        }
        info!(addr = %running.addr, "metrics server stopped");
    }
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("host", &self.runtime.metrics_host)
            .field("port", &self.port)
            .field("addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> MetricsServer {
        MetricsServer::new(
            &RuntimeConfig::default(),
            0,
            Arc::new(Metrics::new()),
            Arc::new(ArcSwap::from_pointee(LifecycleState::Running)),
        )
    }

    #[tokio::test]
    async fn serves_banner_and_metrics() {
        let server = server();
        server.state.metrics.record_request_start();
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        let base = format!("http://{addr}");
        let banner = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(banner.text().await.unwrap(), BANNER);

        let body: serde_json::Value = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["fs_total_requests"], 1);
        assert_eq!(body["fs_active_requests"], 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn probes_report_state() {
        let server = server();
        let addr = server.start().await.unwrap();

        let live = reqwest::get(format!("http://{addr}/health/live")).await.unwrap();
        assert_eq!(live.status(), reqwest::StatusCode::OK);
        let ready = reqwest::get(format!("http://{addr}/health/ready")).await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);

        server.state.lifecycle.store(Arc::new(LifecycleState::ShuttingDown));
        let ready = reqwest::get(format!("http://{addr}/health/ready")).await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        server.stop().await;
    }

    #[tokio::test]
    async fn start_twice_returns_same_addr() {
        let server = server();
        let first = server.start().await.unwrap();
        let second = server.start().await.unwrap();
        assert_eq!(first, second);
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = server();
        server.stop().await;

        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
        assert!(server.local_addr().is_none());
    }
}
