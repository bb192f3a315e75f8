use anyhow::Result;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tracing::info;

async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn create_app() -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
}

/// Serves the health endpoints until the process shuts down.
pub async fn serve(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_app()).await?;
    Ok(())
}
