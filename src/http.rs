//! Operational HTTP endpoint.
//!
//! Routes:
//! - `GET /healthz` - Redis reachability and held leases
//! - `GET /metrics` - Prometheus metrics

use anyhow::Context as _;
use axum::extract::{FromRef, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::error;

use crate::health::{health_handler, HealthState};
use crate::metrics::MetricsRegistry;

#[derive(Clone)]
pub struct HttpState {
    pub health: HealthState,
    pub metrics: MetricsRegistry,
}

impl FromRef<HttpState> for HealthState {
    fn from_ref(state: &HttpState) -> Self {
        state.health.clone()
    }
}

impl FromRef<HttpState> for MetricsRegistry {
    fn from_ref(state: &HttpState) -> Self {
        state.metrics.clone()
    }
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Serve the router on `listen` until `shutdown` resolves.
pub async fn serve(
    listen: &str,
    state: HttpState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = listen.parse().context("invalid metrics_listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;

    tracing::info!(%addr, "HTTP endpoint listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    Ok(())
}

/// `GET /metrics`
async fn handle_metrics(State(metrics): State<MetricsRegistry>) -> Response {
    match metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {e:#}"),
            )
                .into_response()
        }
    }
}
