//! Bearer token authentication.
//!
//! Every `/api/v1` route sits behind [`require_auth`]. Accepted tokens come
//! from `CHRONICLE_API_TOKENS` (comma-separated) and are matched exactly;
//! there is no token hierarchy or scoping.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;

/// Pull the token out of an `Authorization: Bearer <token>` header.
///
/// Returns `None` for a missing header, non-UTF-8 bytes, a different auth
/// scheme, or an empty token.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let token = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Middleware rejecting requests without a configured Bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = bearer_token(request.headers()) else {
        tracing::debug!("missing or malformed authorization header");
        return Err(ApiError::Unauthorized);
    };

    if !state.config.api_tokens.contains(token) {
        tracing::debug!("unrecognized api token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extracts_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc123")), Some("abc123"));
    }

    #[test]
    fn test_rejects_other_schemes_and_empty_tokens() {
        assert_eq!(bearer_token(&headers("Basic abc123")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&headers("bearer abc123")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
