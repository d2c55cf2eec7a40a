use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::response::error_response;
use crate::http::server::AppState;
use crate::security::identity::SourceIdentity;

/// Restrict admin routes to statically allow-listed callers.
///
/// Runs after the gate, which has already checked the bearer token and
/// attached the resolved identity.
pub async fn admin_guard_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.admin.allowlist_only {
        return next.run(request).await;
    }

    let permitted = request
        .extensions()
        .get::<SourceIdentity>()
        .is_some_and(|identity| state.gate.registry().is_statically_allowed(identity));

    if permitted {
        next.run(request).await
    } else {
        tracing::warn!(
            identity = ?request.extensions().get::<SourceIdentity>().map(|i| i.to_string()),
            path = %request.uri().path(),
            "Admin request from identity outside the allow-list"
        );
        error_response(StatusCode::FORBIDDEN, "admin_forbidden", "Access denied")
    }
}
