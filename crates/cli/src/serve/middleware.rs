//! HTTP middleware: per-IP rate limiting and owner API-key authentication.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::error_body;
use super::state::AppState;

pub(crate) async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match state.rate_limiter.check(addr.ip()).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::debug!(client = %addr.ip(), retry_after, "rate limited");
            let mut response = error_body(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "rate limit exceeded",
                None,
            )
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Signer links carry their own credential; health checks carry none.
fn is_public(path: &str) -> bool {
    path == "/health" || path.starts_with("/sign/")
}

/// With `QUIRE_API_KEY` set, owner endpoints need `Authorization: Bearer
/// <key>` or `X-API-Key: <key>`.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    if is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let headers = request.headers();
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));

    match presented {
        Some(key) if key == expected => next.run(request).await,
        Some(_) => {
            error_body(StatusCode::FORBIDDEN, "FORBIDDEN", "invalid API key", None).into_response()
        }
        None => error_body(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "authentication required",
            None,
        )
        .into_response(),
    }
}
