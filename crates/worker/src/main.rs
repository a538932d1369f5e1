//! ComfyUI job worker.
//!
//! A small axum service that accepts jobs over `POST /run`, drives
//! each one through a ComfyUI instance via `comfykit-client`, and
//! returns (and optionally pushes) the result payload.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod callback;
mod config;
mod handler;
mod input;

use config::WorkerConfig;
use handler::JobRequest;

/// Health check response payload.
#[derive(Serialize)]
struct HealthResponse {
    /// Overall service status.
    status: &'static str,
    /// Crate version from Cargo.toml.
    version: &'static str,
}

/// GET /health -- liveness probe.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /run -- execute one job and return its result payload.
async fn run(
    State(config): State<Arc<WorkerConfig>>,
    Json(request): Json<JobRequest>,
) -> Json<serde_json::Value> {
    Json(handler::run_job(&config, request).await)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfykit_worker=debug,comfykit_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = Arc::new(WorkerConfig::from_env());
    tracing::info!(
        comfy_host = %config.comfy_host,
        job_timeout_secs = config.job_timeout.as_secs(),
        refresh_worker = config.refresh_worker,
        "Loaded worker configuration"
    );

    // --- Router ---
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/run", post(run))
        .with_state(config);

    // --- Start server ---
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8000".into())
        .parse()
        .expect("PORT must be a valid u16");
    let addr = SocketAddr::new(host.parse().expect("Invalid HOST address"), port);
    tracing::info!(%addr, "Starting worker");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
