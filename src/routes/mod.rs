pub mod admin;
pub mod auth;
pub mod health;

use axum::{
    middleware::from_fn,
    routing::{delete, get, post, put},
    Router,
};

use crate::middleware::require_identity_provider;

/// All routes, before the gateway and extension layers are applied
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::health))
        .merge(identity_provider_routes())
        .merge(auth_routes())
        .merge(admin_routes())
}

/// Called by the identity provider only, with a signed request
fn identity_provider_routes() -> Router {
    Router::new()
        .route("/auth/login-attempts", post(auth::report_login_attempt))
        .route("/auth/login/session", post(auth::issue_session))
        .route_layer(from_fn(require_identity_provider))
}

fn auth_routes() -> Router {
    Router::new()
        .route("/auth/session", get(auth::current_session))
        .route("/auth/logout", post(auth::logout))
}

fn admin_routes() -> Router {
    Router::new()
        .route("/admin/rate-limits/{limit_type}/{identifier}", get(admin::rate_limit_status))
        .route("/admin/rate-limits/{limit_type}/{identifier}/reset", post(admin::reset_rate_limit))
        .route("/admin/rate-limits/{limit_type}/{identifier}/block", post(admin::block_identifier))
        .route(
            "/admin/whitelist/{limit_type}/{identifier}",
            put(admin::add_to_whitelist).delete(admin::remove_from_whitelist),
        )
        .route("/admin/sessions/user/{user_id}", get(admin::list_user_sessions))
        .route("/admin/sessions/{session_id}", delete(admin::revoke_session))
        .route("/admin/threats", get(admin::recent_threats))
}
