//! Route handlers: owner envelope management and signer links.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use quire_core::{ClientInfo, EnvelopeStatus, SignatureField};
use quire_engine::{CreateEnvelope, EnvelopeError, FieldValues, ListQuery};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::state::AppState;
use super::{error_body, ApiError};

type ApiResult<T> = Result<T, ApiError>;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    error_body(StatusCode::NOT_FOUND, "NOT_FOUND", "not found", None)
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct FieldsBody {
    fields: Vec<SignatureField>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ReasonBody {
    reason: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitBody {
    values: FieldValues,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListParams {
    owner: Option<String>,
    status: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

/// Parse a JSON body, reporting malformed input as INVALID_REQUEST.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| EnvelopeError::InvalidRequest {
            message: format!("invalid JSON body: {e}"),
        }
        .into())
}

/// Like [`parse_body`], but an empty body means `T::default()`.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        parse_body(body)
    }
}

fn parse_count(name: &str, raw: Option<&str>) -> ApiResult<usize> {
    match raw {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            EnvelopeError::InvalidRequest {
                message: format!("{name} must be a non-negative integer"),
            }
            .into()
        }),
    }
}

/// Network details recorded against a signer's actions. The first
/// `X-Forwarded-For` hop wins over the socket peer.
fn client_info(addr: SocketAddr, headers: &HeaderMap) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ClientInfo {
        ip: Some(forwarded.unwrap_or_else(|| addr.ip().to_string())),
        user_agent,
    }
}

fn link_response(token: String) -> Response {
    let body = serde_json::json!({
        "signing_url": format!("/sign/{token}"),
        "token": token,
    });
    (StatusCode::OK, Json(body)).into_response()
}

// ── Owner endpoints ──────────────────────────────────────────────────────────

/// POST /envelopes
pub(crate) async fn handle_create(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: CreateEnvelope = parse_body(&body)?;
    let envelope = state.engine.create_envelope(request).await?;
    Ok((StatusCode::CREATED, Json(envelope)).into_response())
}

/// GET /envelopes
pub(crate) async fn handle_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(EnvelopeStatus::parse(raw).ok_or_else(|| {
            EnvelopeError::InvalidRequest {
                message: format!("unknown status '{raw}'"),
            }
        })?),
    };
    let query = ListQuery {
        owner_id: params.owner.filter(|o| !o.is_empty()),
        status,
        limit: parse_count("limit", params.limit.as_deref())?,
        offset: parse_count("offset", params.offset.as_deref())?,
    };
    let page = state.engine.list_envelopes(&query).await?;
    Ok((StatusCode::OK, Json(page)).into_response())
}

/// GET /envelopes/{id}
pub(crate) async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let envelope = state.engine.get_envelope(&id).await?;
    Ok((StatusCode::OK, Json(envelope)).into_response())
}

/// GET /envelopes/{id}/status
pub(crate) async fn handle_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let summary = state.engine.get_envelope_status(&id).await?;
    Ok((StatusCode::OK, Json(summary)).into_response())
}

/// PUT /envelopes/{id}/fields
pub(crate) async fn handle_update_fields(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let FieldsBody { fields } = parse_body(&body)?;
    let envelope = state.engine.update_fields(&id, fields).await?;
    Ok((StatusCode::OK, Json(envelope)).into_response())
}

/// POST /envelopes/{id}/send
pub(crate) async fn handle_send(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let envelope = state.engine.send(&id).await?;
    Ok((StatusCode::OK, Json(envelope)).into_response())
}

/// POST /envelopes/{id}/cancel
pub(crate) async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let ReasonBody { reason } = parse_optional_body(&body)?;
    let envelope = state.engine.cancel(&id, &reason).await?;
    Ok((StatusCode::OK, Json(envelope)).into_response())
}

/// POST /envelopes/{id}/remind
pub(crate) async fn handle_remind(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let reminded = state.engine.remind(&id).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "reminded": reminded }))).into_response())
}

/// POST /envelopes/{id}/seal
pub(crate) async fn handle_finalize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let envelope = state.engine.finalize(&id).await?;
    Ok((StatusCode::OK, Json(envelope)).into_response())
}

/// POST /envelopes/{id}/signers/{email}/reissue
pub(crate) async fn handle_reissue_link(
    State(state): State<Arc<AppState>>,
    Path((id, email)): Path<(String, String)>,
) -> ApiResult<Response> {
    let token = state.engine.reissue_link(&id, &email).await?;
    Ok(link_response(token))
}

/// GET /envelopes/{id}/signers/{email}/link
pub(crate) async fn handle_copy_link(
    State(state): State<Arc<AppState>>,
    Path((id, email)): Path<(String, String)>,
) -> ApiResult<Response> {
    let token = state.engine.copy_link(&id, &email).await?;
    Ok(link_response(token))
}

// ── Signer endpoints ─────────────────────────────────────────────────────────

/// GET /sign/{token}
pub(crate) async fn handle_signing_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let client = client_info(addr, &headers);
    let session = state.engine.get_signing_session(&token, Some(client)).await?;
    Ok((StatusCode::OK, Json(session)).into_response())
}

/// POST /sign/{token}/submit
pub(crate) async fn handle_submit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let SubmitBody { values } = parse_body(&body)?;
    let client = client_info(addr, &headers);
    let envelope = state
        .engine
        .submit_signature(&token, values, Some(client))
        .await?;
    let body = serde_json::json!({
        "envelope_id": envelope.id,
        "status": envelope.status,
        "completed": envelope.status == EnvelopeStatus::Completed,
    });
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// POST /sign/{token}/decline
pub(crate) async fn handle_decline(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let ReasonBody { reason } = parse_optional_body(&body)?;
    let client = client_info(addr, &headers);
    let envelope = state.engine.decline(&token, &reason, Some(client)).await?;
    let body = serde_json::json!({
        "envelope_id": envelope.id,
        "status": envelope.status,
    });
    Ok((StatusCode::OK, Json(body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_wins_over_peer_address() {
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));
        let client = client_info(addr, &headers);
        assert_eq!(client.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(client.user_agent.as_deref(), Some("curl/8"));

        let client = client_info(addr, &HeaderMap::new());
        assert_eq!(client.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(client.user_agent, None);
    }

    #[test]
    fn empty_bodies_fall_back_to_defaults() {
        let body: ReasonBody = parse_optional_body(&Bytes::from_static(b"  ")).unwrap();
        assert_eq!(body.reason, "");
        let body: ReasonBody =
            parse_optional_body(&Bytes::from_static(br#"{"reason":"wrong file"}"#)).unwrap();
        assert_eq!(body.reason, "wrong file");
        assert!(parse_body::<SubmitBody>(&Bytes::from_static(b"{")).is_err());
    }

    #[test]
    fn counts_must_be_numbers() {
        assert_eq!(parse_count("limit", None).ok(), Some(0));
        assert_eq!(parse_count("limit", Some("25")).ok(), Some(25));
        assert!(parse_count("limit", Some("-1")).is_err());
    }
}
