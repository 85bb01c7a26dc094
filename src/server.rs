//! # Health and Metrics Server
//!
//! Small axum app serving the operator's operational endpoints:
//!
//! | Path       | Purpose                                              |
//! |------------|------------------------------------------------------|
//! | `/metrics` | Prometheus text exposition of the operator registry  |
//! | `/healthz` | Liveness, 200 as long as the process answers         |
//! | `/readyz`  | Readiness, 200 while the watch loops are running     |
//!
//! Listens on `0.0.0.0:<METRICS_PORT>`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Readiness shared between the server and the watch loops.
/// Set once the listener is bound, cleared on shutdown.
#[derive(Debug, Default)]
pub struct ServerState {
    ready: AtomicBool,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/readyz", get(serve_readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health and metrics server bound");
    state.set_ready(true);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn encode_registry() -> Result<Vec<u8>, prometheus::Error> {
    let families = crate::observability::metrics::REGISTRY.gather();
    let mut body = Vec::with_capacity(4096);
    TextEncoder::new().encode(&families, &mut body)?;
    Ok(body)
}

async fn serve_metrics() -> impl IntoResponse {
    match encode_registry() {
        Ok(body) => (StatusCode::OK, [("content-type", EXPOSITION_CONTENT_TYPE)], body),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("metrics encoding failed: {e}").into_bytes(),
            )
        }
    }
}

async fn serve_readiness(State(state): State<Arc<ServerState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
