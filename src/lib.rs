pub mod auth;
pub mod clock;
pub mod config;
pub mod database;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod routes;

use axum::{extract::Extension, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::{AuditManager, SecurityMonitor, SessionManager},
    clock::SharedClock,
    config::Config,
    database::{CounterStore, SessionStore},
    middleware::{gateway_middleware, Gateway, IdpVerifier, RateLimiter},
};

pub use errors::{AppError, Result};

/// The components behind the gateway, wired to their stores
#[derive(Clone)]
pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub session_manager: Arc<SessionManager>,
    pub monitor: Arc<SecurityMonitor>,
    pub audit: Arc<AuditManager>,
    pub gateway: Arc<Gateway>,
    pub idp: Arc<IdpVerifier>,
}

impl AppState {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        sessions: Arc<dyn SessionStore>,
        config: &Config,
        clock: SharedClock,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            counters.clone(),
            config.rate_limits.clone(),
            clock.clone(),
        ));
        let session_manager = Arc::new(SessionManager::new(
            sessions,
            rate_limiter.clone(),
            config.sessions.clone(),
            clock.clone(),
        ));
        let audit = Arc::new(AuditManager::with_config(config.audit.clone()));
        let monitor = Arc::new(SecurityMonitor::new(
            counters,
            session_manager.clone(),
            rate_limiter.clone(),
            audit.clone(),
            config.monitor.clone(),
            clock.clone(),
        ));
        let gateway = Arc::new(Gateway::new(
            rate_limiter.clone(),
            session_manager.clone(),
            monitor.clone(),
            config.gateway(),
        ));
        let idp = Arc::new(IdpVerifier::new(config.idp_secret.as_deref(), config.idp_max_skew, clock));

        Self {
            rate_limiter,
            session_manager,
            monitor,
            audit,
            gateway,
            idp,
        }
    }
}

/// Routes behind the gateway, with tracing, CORS and the component extensions
pub fn build_router(state: &AppState) -> Router {
    routes::router()
        .layer(axum::middleware::from_fn(gateway_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(Extension(state.rate_limiter.clone()))
                .layer(Extension(state.session_manager.clone()))
                .layer(Extension(state.monitor.clone()))
                .layer(Extension(state.audit.clone()))
                .layer(Extension(state.gateway.clone()))
                .layer(Extension(state.idp.clone())),
        )
}
