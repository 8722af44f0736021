//! # Status Endpoint
//!
//! Local HTTP endpoint for operators and the service manager:
//! - `GET /health`: the current [`HealthSnapshot`] as JSON; 503 while unhealthy
//! - `GET /metrics`: Prometheus text exposition
//!
//! Also holds the client side used by `gnss-spooler status`.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{Result, SpoolerError};
use crate::health::{HealthLevel, HealthSnapshot};
use crate::shutdown::stopped;
use crate::telemetry::metrics::Metrics;

/// `status` exit code when the endpoint cannot be reached
pub const EXIT_UNREACHABLE: i32 = 3;

/// Shared state of the status handlers
#[derive(Clone)]
pub struct StatusState {
    pub snapshot: watch::Receiver<HealthSnapshot>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<StatusState>) -> Response {
    let snapshot = state.snapshot.borrow().clone();
    let code = match snapshot.composite {
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(snapshot)).into_response()
}

async fn metrics(State(state): State<StatusState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Bind the status listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| SpoolerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serve until shutdown
pub async fn serve(listener: TcpListener, state: StatusState, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Status endpoint listening on http://{}", addr);
    }

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await;

    match result {
        Ok(()) => info!("Status endpoint stopped"),
        Err(e) => error!("Status endpoint failed: {}", e),
    }
}

/// Fetch the health snapshot from a running spooler
pub async fn query(addr: &str, timeout: Duration) -> anyhow::Result<HealthSnapshot> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let snapshot = client
        .get(format!("http://{}/health", addr))
        .send()
        .await?
        .json::<HealthSnapshot>()
        .await?;
    Ok(snapshot)
}

/// Exit code of `gnss-spooler status` for a composite level
pub fn exit_code(level: HealthLevel) -> i32 {
    match level {
        HealthLevel::Healthy => 0,
        HealthLevel::Degraded => 1,
        HealthLevel::Unhealthy => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{Subsystem, SubsystemStatus};
    use chrono::Utc;

    fn snapshot(level: HealthLevel) -> HealthSnapshot {
        let now = Utc::now();
        let mut snapshot = HealthSnapshot::initial(now);
        snapshot.composite = level;
        snapshot.subsystems.insert(
            Subsystem::Sink,
            SubsystemStatus {
                level,
                since: now,
                last_good: None,
                last_observation: Some(now),
                consecutive_failures: 4,
                detail: "HTTP 503".to_string(),
            },
        );
        snapshot
    }

    async fn start(
        level: HealthLevel,
    ) -> (
        SocketAddr,
        watch::Sender<HealthSnapshot>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.records_spooled.inc_by(7);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot(level));
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = crate::shutdown::channel();
        let state = StatusState {
            snapshot: snapshot_rx,
            metrics,
        };
        let task = tokio::spawn(serve(listener, state, shutdown_rx));
        (addr, snapshot_tx, shutdown_tx, task)
    }

    #[tokio::test]
    async fn test_health_reports_snapshot() {
        let (addr, snapshot_tx, shutdown_tx, task) = start(HealthLevel::Degraded).await;

        let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["composite"], "degraded");
        assert_eq!(body["subsystems"]["sink"]["consecutive_failures"], 4);

        snapshot_tx.send_replace(snapshot(HealthLevel::Unhealthy));
        let status = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .status();
        assert_eq!(status, 503);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (addr, _snapshot_tx, shutdown_tx, task) = start(HealthLevel::Healthy).await;

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("spooler_records_spooled_total 7"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_maps_to_exit_codes() {
        let (addr, snapshot_tx, shutdown_tx, task) = start(HealthLevel::Healthy).await;
        let addr = addr.to_string();
        let timeout = Duration::from_secs(2);

        let reported = query(&addr, timeout).await.unwrap();
        assert_eq!(exit_code(reported.composite), 0);

        snapshot_tx.send_replace(snapshot(HealthLevel::Unhealthy));
        let reported = query(&addr, timeout).await.unwrap();
        assert_eq!(exit_code(reported.composite), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(query(&addr, timeout).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_resource_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = bind(taken.local_addr().unwrap()).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_RESOURCES);
    }
}
