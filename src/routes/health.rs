use axum::{extract::Extension, http::StatusCode, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::{auth::ses::SessionManager, middleware::rate::RateLimiter};

fn store_status(name: &str, result: crate::errors::Result<()>) -> &'static str {
    match result {
        Ok(()) => "up",
        Err(e) => {
            warn!("Health check failed for {}: {}", name, e);
            "down"
        }
    }
}

/// Ping both stores. 503 if either is down.
pub async fn health(
    Extension(rate_limiter): Extension<Arc<RateLimiter>>,
    Extension(session_manager): Extension<Arc<SessionManager>>,
) -> (StatusCode, Json<Value>) {
    let counter_store = store_status("counter store", rate_limiter.health_check().await);
    let session_store = store_status("session store", session_manager.health_check().await);

    let healthy = counter_store == "up" && session_store == "up";
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "counterStore": counter_store,
            "sessionStore": session_store,
        })),
    )
}
