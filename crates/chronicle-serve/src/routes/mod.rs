//! API route definitions.

mod health;
mod stats;

use axum::http::header;
use axum::middleware;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Public (no auth)
/// - `GET /health` - Health check
///
/// ## Protected (auth required)
/// - `GET /api/v1/ping` - Token validity check
/// - `GET /api/v1/stats` - Tenant overview totals
/// - `GET /api/v1/rankings/messages` - Top users by message count
/// - `GET /api/v1/rankings/voice` - Top users by voice time
/// - `GET /api/v1/rankings/mentions` - Most mentioned users
/// - `GET /api/v1/rankings/emoji` - Most used emoji
/// - `GET /api/v1/rankings/invites` - Top inviters by invite uses
/// - `GET /api/v1/users/{user_id}` - Per-user activity summary
pub fn router(state: AppState) -> Router {
    // Public routes (no authentication)
    let public = Router::new().route("/health", get(health::health_check));

    // Protected API routes
    let api_v1 = Router::new()
        .route("/ping", get(health::authenticated_ping))
        .route("/stats", get(stats::overview))
        .route("/rankings/messages", get(stats::message_rankings))
        .route("/rankings/voice", get(stats::voice_rankings))
        .route("/rankings/mentions", get(stats::mention_rankings))
        .route("/rankings/emoji", get(stats::emoji_rankings))
        .route("/rankings/invites", get(stats::invite_rankings))
        .route("/users/{user_id}", get(stats::user_summary))
        // Auth middleware
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        // Cache headers middleware
        .layer(middleware::map_response(add_cache_headers));

    Router::new()
        .merge(public)
        .nest("/api/v1", api_v1)
        .with_state(state)
}

/// Add cache headers to API responses.
///
/// Sets a default cache duration of 60 seconds for successful responses.
async fn add_cache_headers(response: Response) -> Response {
    if response.status().is_success() {
        let (mut parts, body) = response.into_parts();
        parts.headers.insert(
            header::CACHE_CONTROL,
            "public, max-age=60, stale-while-revalidate=300"
                .parse()
                .expect("valid header value"),
        );
        Response::from_parts(parts, body)
    } else {
        response
    }
}
