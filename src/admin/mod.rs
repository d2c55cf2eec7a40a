//! Administrative control surface.
//!
//! Every route here sits behind the protection gate like any other request,
//! then behind the admin guard.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_guard_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/protection/stats", get(get_stats))
        .route("/protection/entries", get(list_entries))
        .route("/protection/threats", get(list_threats))
        .route("/protection/token/generate", post(generate_token))
        .route("/protection/token/revoke", post(revoke_token))
        .route("/protection/block/{identity}", post(block_identity))
        .route("/protection/unblock/{identity}", post(unblock_identity))
        .route("/protection/allow/{identity}", post(allow_identity))
        .layer(middleware::from_fn_with_state(state.clone(), admin_guard_middleware))
        .with_state(state)
}
