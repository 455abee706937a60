//! `quire serve` -- HTTP JSON API over the envelope orchestrator.
//!
//! Security:
//! - CORS headers on all responses (permissive)
//! - Per-IP rate limiting (default: 60 req/min, `QUIRE_RATE_LIMIT`)
//! - Optional owner API key via `QUIRE_API_KEY`; `/health` and `/sign/*`
//!   stay public since signer links are their own credential
//!
//! Owner endpoints:
//! - POST /envelopes                               - Create a DRAFT envelope
//! - GET  /envelopes?owner=&status=&limit=&offset= - List envelope summaries
//! - GET  /envelopes/{id}                          - Full envelope record
//! - GET  /envelopes/{id}/status                   - Envelope summary
//! - PUT  /envelopes/{id}/fields                   - Replace the field set (DRAFT only)
//! - POST /envelopes/{id}/send                     - Validate and send
//! - POST /envelopes/{id}/cancel                   - Withdraw the envelope
//! - POST /envelopes/{id}/remind                   - Re-notify active signers
//! - POST /envelopes/{id}/seal                     - Retry sealing
//! - POST /envelopes/{id}/signers/{email}/reissue  - Fresh signing link
//! - GET  /envelopes/{id}/signers/{email}/link     - Current signing link
//!
//! Signer endpoints:
//! - GET  /sign/{token}          - Signing session
//! - POST /sign/{token}/submit   - Submit field values
//! - POST /sign/{token}/decline  - Decline to sign
//!
//! Errors are `{"error": <message>, "code": <CODE>, "violations": [...]}`.

mod handlers;
mod middleware;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{middleware as axum_middleware, Json, Router};
use quire_engine::{EnvelopeError, FsBlobStore, LogNotifier, Orchestrator, SystemClock};
use quire_storage::MemoryStore;
use tower_http::cors::{Any, CorsLayer};

use self::handlers::*;
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, RateLimiter};
use crate::config::ServerConfig;

/// Rate limit window.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// The JSON error body every failure uses.
pub(crate) fn error_body(
    status: StatusCode,
    code: &str,
    message: &str,
    violations: Option<serde_json::Value>,
) -> impl IntoResponse {
    let mut body = serde_json::json!({ "error": message, "code": code });
    if let Some(violations) = violations {
        body["violations"] = violations;
    }
    (status, Json(body))
}

/// HTTP status for an engine failure code.
pub(crate) fn status_for(code: &str) -> StatusCode {
    match code {
        "INVALID_REQUEST" => StatusCode::BAD_REQUEST,
        "NOT_FOUND" | "SIGNER_NOT_FOUND" | "INVALID_TOKEN" => StatusCode::NOT_FOUND,
        "EXPIRED" => StatusCode::GONE,
        "INVALID_SIGNERS" | "VALIDATION_FAILED" | "INCOMPLETE_VALUES" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "SEALING_FAILED" | "STORAGE_ERROR" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let ApiError(err) = self;
        let code = err.code();
        let status = status_for(code);
        if status.is_server_error() {
            tracing::error!(code, error = %err, "request failed");
        }
        error_body(status, code, &err.to_string(), err.violations()).into_response()
    }
}

/// An engine error on its way out as a JSON response.
#[derive(Debug)]
pub(crate) struct ApiError(pub(crate) EnvelopeError);

impl From<EnvelopeError> for ApiError {
    fn from(err: EnvelopeError) -> Self {
        ApiError(err)
    }
}

pub(crate) fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/envelopes", post(handle_create).get(handle_list))
        .route("/envelopes/{id}", get(handle_get))
        .route("/envelopes/{id}/status", get(handle_status))
        .route("/envelopes/{id}/fields", put(handle_update_fields))
        .route("/envelopes/{id}/send", post(handle_send))
        .route("/envelopes/{id}/cancel", post(handle_cancel))
        .route("/envelopes/{id}/remind", post(handle_remind))
        .route("/envelopes/{id}/seal", post(handle_finalize))
        .route(
            "/envelopes/{id}/signers/{email}/reissue",
            post(handle_reissue_link),
        )
        .route("/envelopes/{id}/signers/{email}/link", get(handle_copy_link))
        .route("/sign/{token}", get(handle_signing_session))
        .route("/sign/{token}/submit", post(handle_submit))
        .route("/sign/{token}/decline", post(handle_decline))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Periodically expire overdue envelopes and forget stale rate-limit windows.
fn spawn_sweeper(state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = state.engine.expire_overdue().await {
                tracing::warn!(error = %e, "expiry sweep failed");
            }
            state.rate_limiter.prune().await;
        }
    });
}

/// Start the HTTP server.
///
/// When TLS cert/key paths are provided (and the `tls` feature is built),
/// the server listens over HTTPS using `axum-server` with rustls.
pub async fn start_server(
    config: ServerConfig,
    _tls_cert: Option<PathBuf>,
    _tls_key: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = &config.server.data_dir;
    tokio::fs::create_dir_all(data_dir).await?;

    let engine = Orchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(FsBlobStore::new(data_dir)),
        Arc::new(LogNotifier),
        Arc::new(SystemClock),
        config.engine.clone(),
    );
    if config.api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    tracing::info!(
        rate_limit = config.server.rate_limit,
        data_dir = %data_dir.display(),
        "server configured"
    );

    let state = Arc::new(AppState {
        engine,
        rate_limiter: RateLimiter::new(config.server.rate_limit, RATE_LIMIT_WINDOW),
        api_key: config.api_key.clone(),
    });
    spawn_sweeper(
        state.clone(),
        Duration::from_secs(config.engine.sweep_interval_secs),
    );

    let app = build_router(state, config.server.max_body_bytes);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));

    #[cfg(feature = "tls")]
    if let (Some(cert_path), Some(key_path)) = (&_tls_cert, &_tls_key) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
        tracing::info!("quire listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("quire listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for Ctrl+C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
