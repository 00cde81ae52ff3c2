//! Tower middleware for the metrics endpoint.
//!
//! Every response carries an `x-request-id`. Scrapes are traced at DEBUG so a
//! frequent collector stays out of INFO logs, and a handler that outlives
//! `runtime.metrics_request_timeout_ms` answers 408.

use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::RuntimeConfig;

type ScrapeTrace = TraceLayer<SharedClassifier<ServerErrorsAsFailures>>;

type MetricsHttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<TimeoutLayer, Stack<ScrapeTrace, Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>>>,
>;

/// Layers for the metrics router, tuned by the `runtime:` section.
#[must_use]
pub fn build_http_layers(runtime: &RuntimeConfig) -> MetricsHttpLayers {
    let request_id = HeaderName::from_static("x-request-id");
    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(trace)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            runtime.metrics_request_timeout(),
        ))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}
