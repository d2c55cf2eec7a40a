//! Protection middleware.
//! Runs the request gate before anything else sees the request.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::http::request::request_id;
use crate::http::response::{deny_response, payload_too_large};
use crate::http::server::AppState;
use crate::security::gate::Decision;
use crate::security::identity::resolve_identity;
use crate::security::threat::RequestDescriptor;
use crate::security::tokens::bearer_token;

/// Resolve the caller, screen the request head, then buffer the body and
/// finish the gate.
///
/// Blocked and throttled callers are answered before their body is read.
/// Admitted requests continue with the buffered body and the resolved
/// [`SourceIdentity`](crate::security::SourceIdentity) in their extensions.
pub async fn protection_middleware(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let settings = state.gate.settings();
    let identity = resolve_identity(peer, request.headers(), &settings.trusted_proxies);

    let (mut parts, body) = request.into_parts();
    let mut descriptor = RequestDescriptor::from_head(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query(),
        &parts.headers,
        &settings.inspected_headers,
    );
    if let Decision::Deny { reason, .. } = state.gate.screen(&identity, &descriptor) {
        return deny_response(reason);
    }

    let bytes = match axum::body::to_bytes(body, settings.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(
                request_id = request_id(&parts.headers),
                identity = %identity,
                limit = settings.max_body_bytes,
                error = %e,
                "Request body rejected"
            );
            return payload_too_large(settings.max_body_bytes);
        }
    };
    descriptor.attach_body(&bytes, settings.body_preview_bytes);

    match state.gate.inspect(&identity, &descriptor, bearer_token(&parts.headers)) {
        Decision::Admit => {
            tracing::debug!(identity = %identity, "Request admitted");
            parts.extensions.insert(identity);
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        Decision::Deny { reason, .. } => deny_response(reason),
    }
}
