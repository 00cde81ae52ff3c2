//! Route handlers for the metrics endpoint.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::lifecycle::LifecycleState;
use crate::metrics::{Metrics, MetricsSnapshot};

/// Body of `GET /`.
pub const BANNER: &str = "FS SDK Metrics Server\nUse /metrics endpoint to get metrics data";

/// Shared state carried through axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub lifecycle: Arc<ArcSwap<LifecycleState>>,
}

pub async fn banner_handler() -> &'static str {
    BANNER
}

/// Current counters as a JSON object.
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Liveness probe. Always 200 while the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe. 200 only while the consume loop is running.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if **state.lifecycle.load() == LifecycleState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
