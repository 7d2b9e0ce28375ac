//! Health check endpoints.

use axum::Json;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Public health check endpoint.
///
/// Returns basic service health without authentication.
/// Use this for load balancer health probes.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Authenticated ping response.
#[derive(Debug, Clone, Serialize)]
pub struct PingResponse {
    message: &'static str,
}

/// Confirms authentication works; useful for clients verifying a token.
pub async fn authenticated_ping() -> Json<PingResponse> {
    Json(PingResponse { message: "pong" })
}
