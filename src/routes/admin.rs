use axum::{
    extract::{Extension, Path, Query},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::{
    auth::{audit::AuditEntry, audit::AuditManager, ses::SessionManager},
    errors::{AppError, Result},
    middleware::{rate::RateLimiter, AuthSession},
    models::{
        rate::{BlockState, LimitType, RateLimitStatus},
        ses::SessionSummary,
    },
};

const MAX_THREATS_PAGE: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub duration_seconds: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistQuery {
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ThreatsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total_count: usize,
}

fn limit_type(raw: &str) -> Result<LimitType> {
    raw.parse()
}

pub async fn reset_rate_limit(
    Extension(rate_limiter): Extension<Arc<RateLimiter>>,
    Extension(admin): Extension<AuthSession>,
    Path((raw_type, identifier)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let limit_type = limit_type(&raw_type)?;
    rate_limiter.reset(limit_type, &identifier).await?;
    info!(admin = %admin.user_id(), limit_type = %limit_type, identifier = %identifier, "Admin reset rate limit");
    Ok(Json(json!({ "reset": true })))
}

pub async fn rate_limit_status(
    Extension(rate_limiter): Extension<Arc<RateLimiter>>,
    Path((raw_type, identifier)): Path<(String, String)>,
) -> Result<Json<RateLimitStatus>> {
    let limit_type = limit_type(&raw_type)?;
    Ok(Json(rate_limiter.status(limit_type, &identifier).await?))
}

pub async fn block_identifier(
    Extension(rate_limiter): Extension<Arc<RateLimiter>>,
    Extension(admin): Extension<AuthSession>,
    Path((raw_type, identifier)): Path<(String, String)>,
    Json(request): Json<BlockRequest>,
) -> Result<Json<BlockState>> {
    let limit_type = limit_type(&raw_type)?;
    if request.duration_seconds == 0 {
        return Err(AppError::bad_request("durationSeconds must be positive"));
    }

    let reason = request.reason.unwrap_or_else(|| "admin_block".to_string());
    let block = rate_limiter
        .block(limit_type, &identifier, request.duration_seconds, &reason)
        .await?;
    info!(admin = %admin.user_id(), limit_type = %limit_type, identifier = %identifier, "Admin block issued");
    Ok(Json(block))
}

pub async fn add_to_whitelist(
    Extension(rate_limiter): Extension<Arc<RateLimiter>>,
    Extension(admin): Extension<AuthSession>,
    Path((raw_type, identifier)): Path<(String, String)>,
    Query(query): Query<WhitelistQuery>,
) -> Result<Json<Value>> {
    let limit_type = limit_type(&raw_type)?;
    rate_limiter
        .add_to_whitelist(limit_type, &identifier, query.ttl_seconds)
        .await?;
    info!(admin = %admin.user_id(), limit_type = %limit_type, identifier = %identifier, "Admin whitelisted identifier");
    Ok(Json(json!({ "whitelisted": true, "ttlSeconds": query.ttl_seconds })))
}

pub async fn remove_from_whitelist(
    Extension(rate_limiter): Extension<Arc<RateLimiter>>,
    Path((raw_type, identifier)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let limit_type = limit_type(&raw_type)?;
    rate_limiter.remove_from_whitelist(limit_type, &identifier).await?;
    Ok(Json(json!({ "whitelisted": false })))
}

pub async fn list_user_sessions(
    Extension(session_manager): Extension<Arc<SessionManager>>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionListResponse>> {
    let now = session_manager.now();
    let sessions: Vec<SessionSummary> = session_manager
        .list_user_sessions(&user_id)
        .await?
        .iter()
        .map(|s| SessionSummary::of(s, now))
        .collect();

    Ok(Json(SessionListResponse {
        total_count: sessions.len(),
        sessions,
    }))
}

pub async fn revoke_session(
    Extension(session_manager): Extension<Arc<SessionManager>>,
    Extension(admin): Extension<AuthSession>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    if session_manager.get_session(&session_id).await?.is_none() {
        return Err(AppError::not_found("Session"));
    }
    let revoked = session_manager.revoke_session(&session_id, "admin_revoked").await?;
    info!(admin = %admin.user_id(), session_id = %session_id, revoked, "Admin session revocation");
    Ok(Json(json!({ "revoked": revoked })))
}

pub async fn recent_threats(
    Extension(audit): Extension<Arc<AuditManager>>,
    Query(query): Query<ThreatsQuery>,
) -> Json<Vec<AuditEntry>> {
    let limit = query.limit.unwrap_or(50).min(MAX_THREATS_PAGE);
    Json(audit.recent(limit).await)
}
