// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metrics and health endpoints.

use crate::metrics::SidecarMetrics;
use asya_transport::Transport;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router as AxumRouter;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Router metrics to export.
    pub metrics: Arc<SidecarMetrics>,
    /// Transport probed by the readiness endpoint.
    pub transport: Arc<dyn Transport>,
}

/// Build the `/metrics`, `/healthz` and `/readyz` router.
pub fn build_app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Prometheus text-format export.
async fn metrics_handler(
    State(state): State<AppState>,
) -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

/// Liveness: the process is up.
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness: the transport answers.
async fn readyz(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    state
        .transport
        .health_check()
        .await
        .map(|()| "ok")
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asya_transport::MemoryTransport;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState {
            metrics: Arc::new(SidecarMetrics::new()),
            transport: Arc::new(MemoryTransport::new()),
        }
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = build_app(state());
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_follows_transport_health() {
        let app = build_app(state());
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_prometheus_text() {
        let s = state();
        s.metrics
            .messages_total
            .with_label_values(&["a", "happy_end"])
            .inc();
        let app = build_app(s);
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("asya_sidecar_messages_total"));
    }
}
