//! `GET /healthz`: can this process reach the coordination store, and which
//! leases does it hold right now.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use serde::Serialize;
use tokio::time::Instant;

use crate::shutdown::LeaseRegistry;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: StoreCheck,
    pub leases: LeaseSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ready,
    /// Termination has begun; leases are being (or have been) released.
    Draining,
    StoreUnreachable,
}

impl HealthStatus {
    fn http_status(self) -> StatusCode {
        match self {
            HealthStatus::Ready => StatusCode::OK,
            HealthStatus::Draining | HealthStatus::StoreUnreachable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StoreCheck {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaseSummary {
    pub held: Vec<String>,
    pub shutting_down: bool,
}

fn overall(store: &StoreCheck, leases: &LeaseSummary) -> HealthStatus {
    if leases.shutting_down {
        HealthStatus::Draining
    } else if !store.reachable {
        HealthStatus::StoreUnreachable
    } else {
        HealthStatus::Ready
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub redis: Pool,
    pub registry: LeaseRegistry,
    /// Upper bound on the PING round-trip.
    pub ping_timeout: Duration,
}

async fn ping_store(pool: &Pool, timeout: Duration) -> StoreCheck {
    let started = Instant::now();
    let error = match tokio::time::timeout(timeout, pool.ping::<String>(None)).await {
        Ok(Ok(_)) => {
            return StoreCheck {
                reachable: true,
                latency_ms: Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
                error: None,
            }
        }
        Ok(Err(e)) => format!("PING failed: {e}"),
        Err(_) => format!("PING timed out after {timeout:?}"),
    };
    StoreCheck {
        reachable: false,
        latency_ms: None,
        error: Some(error),
    }
}

/// Returns 200 only when the store answers and the process is not shutting
/// down.  A process that cannot reach Redis keeps retrying acquisition
/// quietly, so this is where operators see it.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let store = ping_store(&state.redis, state.ping_timeout).await;
    let leases = LeaseSummary {
        held: state.registry.held_keys(),
        shutting_down: state.registry.is_closed(),
    };
    let status = overall(&store, &leases);
    (
        status.http_status(),
        Json(HealthReport {
            status,
            store,
            leases,
        }),
    )
}
