use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ProtectorError;
use crate::http::response::{error_response, message_response};
use crate::http::server::AppState;
use crate::security::access_registry::{AccessEntry, AccessSource, UnblockOutcome};
use crate::security::gate::ProtectionStats;
use crate::security::identity::SourceIdentity;
use crate::security::threat::ThreatEvent;

const DEFAULT_THREAT_LIMIT: usize = 50;

#[derive(Serialize)]
pub struct DataBody<T> {
    pub success: bool,
    pub data: T,
}

#[derive(Serialize)]
pub struct TokenBody {
    pub success: bool,
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ThreatQuery {
    pub limit: Option<usize>,
}

fn data<T: Serialize>(data: T) -> Response {
    Json(DataBody { success: true, data }).into_response()
}

fn protector_error(e: ProtectorError) -> Response {
    match e {
        ProtectorError::PolicyViolation(msg) => error_response(StatusCode::FORBIDDEN, "policy_violation", msg),
        ProtectorError::InvalidIdentity(msg) => error_response(StatusCode::BAD_REQUEST, "invalid_identity", msg),
        other => {
            tracing::error!(error = %other, "Admin operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Operation failed")
        }
    }
}

/// Empty bodies are allowed; anything else must be JSON.
fn parse_body<T: Default + for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_body", format!("Invalid JSON body: {e}")))
}

fn reason_or(request: ReasonRequest, fallback: &str) -> String {
    request
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub async fn get_stats(State(state): State<AppState>) -> Json<DataBody<ProtectionStats>> {
    Json(DataBody {
        success: true,
        data: state.gate.stats(),
    })
}

pub async fn generate_token(State(state): State<AppState>) -> Json<TokenBody> {
    Json(TokenBody {
        success: true,
        token: state.gate.tokens().issue(),
    })
}

/// Always reports success so callers cannot probe which tokens exist.
pub async fn revoke_token(State(state): State<AppState>, body: Bytes) -> Response {
    let request: RevokeRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_body", format!("Invalid JSON body: {e}"));
        }
    };
    state.gate.tokens().revoke(request.token.trim());
    message_response("Token revoked")
}

pub async fn block_identity(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    body: Bytes,
) -> Response {
    let request: ReasonRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let identity = match SourceIdentity::parse(&identity) {
        Ok(i) => i,
        Err(e) => return protector_error(e),
    };

    let reason = reason_or(request, "manual block");
    match state.gate.registry().block(&identity, &reason, AccessSource::Manual) {
        Ok(_) => message_response(format!("Identity {identity} blocked")),
        Err(e) => protector_error(e),
    }
}

pub async fn unblock_identity(State(state): State<AppState>, Path(identity): Path<String>) -> Response {
    let identity = match SourceIdentity::parse(&identity) {
        Ok(i) => i,
        Err(e) => return protector_error(e),
    };

    match state.gate.registry().unblock(&identity) {
        Ok(UnblockOutcome::Unblocked) => message_response(format!("Identity {identity} unblocked")),
        Ok(UnblockOutcome::NotBlocked) => message_response(format!("Identity {identity} was not blocked")),
        Err(e) => protector_error(e),
    }
}

pub async fn allow_identity(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    body: Bytes,
) -> Response {
    let request: ReasonRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let identity = match SourceIdentity::parse(&identity) {
        Ok(i) => i,
        Err(e) => return protector_error(e),
    };

    let reason = reason_or(request, "manual allow");
    match state.gate.registry().allow(&identity, &reason) {
        Ok(_) => message_response(format!("Identity {identity} allowed")),
        Err(e) => protector_error(e),
    }
}

pub async fn list_threats(State(state): State<AppState>, Query(query): Query<ThreatQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_THREAT_LIMIT);
    let events: Vec<ThreatEvent> = state.gate.detector().recent_events(limit);
    data(events)
}

pub async fn list_entries(State(state): State<AppState>) -> Response {
    let entries: Vec<AccessEntry> = state.gate.registry().entries();
    data(entries)
}
