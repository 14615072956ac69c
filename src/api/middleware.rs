//! HTTP middleware.
//!
//! Bearer-token authentication with constant-time comparison. The token
//! comes from configuration; with auth enabled and no token configured,
//! every authenticated route rejects.

use axum::{extract::Request, extract::State, http::StatusCode, middleware::Next, response::Response};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Resolved authentication settings shared with the middleware.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub enabled: bool,
    pub token: Option<String>,
}

pub async fn auth_middleware(
    State(auth): State<Arc<AuthSettings>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !auth.enabled {
        return Ok(next.run(request).await);
    }

    let expected = match auth.token {
        Some(ref token) if !token.is_empty() => token,
        _ => {
            tracing::error!("authentication enabled but no bearer token configured");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Constant-time comparison to prevent timing attacks.
    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!("authentication failed: invalid bearer token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
