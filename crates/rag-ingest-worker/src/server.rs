//! Health endpoints
//!
//! - `GET /health` - liveness, always `OK` while the process runs
//! - `GET /ready` - checks every collaborator, 503 when any is down

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::processing::{ConsumptionLoop, LoopStats, StatsSnapshot};
use crate::providers::{FileStore, ParserService};
use crate::queue::MessageSource;
use crate::storage::JobStore;

/// Upper bound on each dependency probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// What the readiness probe inspects
#[derive(Clone)]
pub struct HealthState {
    jobs: JobStore,
    files: Arc<dyn FileStore>,
    parser: Arc<dyn ParserService>,
    source: Arc<dyn MessageSource>,
    stats: Arc<LoopStats>,
}

impl HealthState {
    pub fn new(
        jobs: JobStore,
        files: Arc<dyn FileStore>,
        parser: Arc<dyn ParserService>,
        source: Arc<dyn MessageSource>,
        stats: Arc<LoopStats>,
    ) -> Self {
        Self {
            jobs,
            files,
            parser,
            source,
            stats,
        }
    }

    /// Probe the collaborators of a running loop
    pub fn for_loop(consumer: &ConsumptionLoop) -> Self {
        let pipeline = consumer.pipeline();
        Self::new(
            pipeline.jobs().clone(),
            pipeline.files().clone(),
            pipeline.parser().clone(),
            consumer.source().clone(),
            consumer.stats_handle(),
        )
    }
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    checks: BTreeMap<&'static str, String>,
    stats: StatsSnapshot,
}

async fn probe<E: std::fmt::Display>(
    check: impl std::future::Future<Output = std::result::Result<(), E>>,
) -> String {
    match tokio::time::timeout(PROBE_TIMEOUT, check).await {
        Ok(Ok(())) => "ok".to_string(),
        Ok(Err(e)) => format!("error: {}", e),
        Err(_) => format!("error: no answer within {:?}", PROBE_TIMEOUT),
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness check endpoint
async fn readiness(State(state): State<HealthState>) -> (StatusCode, Json<Readiness>) {
    let (record_store, file_store, parser) = futures_util::join!(
        probe(state.jobs.health_check()),
        probe(state.files.health_check()),
        probe(state.parser.health_check()),
    );
    let queue = if state.source.is_healthy() {
        "ok".to_string()
    } else {
        "error: broker connection lost".to_string()
    };

    let checks = BTreeMap::from([
        ("record_store", record_store),
        ("file_store", file_store),
        ("parser", parser),
        ("queue", queue),
    ]);
    let ready = checks.values().all(|status| status == "ok");
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(Readiness {
            ready,
            checks,
            stats: state.stats.snapshot(),
        }),
    )
}

/// Build the health router
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve until `cancel` fires
pub async fn serve(addr: &str, state: HealthState, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::config(format!("Invalid health bind address '{}': {}", addr, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("Failed to bind {}: {}", addr, e)))?;

    tracing::info!("Health endpoints on http://{}", addr);
    serve_on(listener, state, cancel).await
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve_on(
    listener: TcpListener,
    state: HealthState,
    cancel: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::internal(format!("Health server error: {}", e)))
}
