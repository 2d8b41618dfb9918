use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    auth::{
        ses::SessionManager,
        threat::SecurityMonitor,
        utils::{extract_device_fingerprint, extract_user_agent},
    },
    errors::Result,
    middleware::{create_delete_cookie, create_secure_cookie, AuthSession, ClientIp},
    models::{
        security::{LoginAttempt, Mitigation, ThreatEvent},
        ses::{DeviceInfo, Role, SessionSummary},
    },
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttemptRequest {
    pub user_id: Option<String>,
    pub clinic_id: Option<String>,
    pub success: bool,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttemptResponse {
    pub threats: Vec<ThreatEvent>,
    /// Strongest response applied, if any threat was found
    pub mitigation: Option<Mitigation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSessionRequest {
    pub user_id: String,
    pub clinic_id: String,
    pub role: Role,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSessionResponse {
    pub session: SessionSummary,
    pub device_trusted: bool,
}

/// The identity provider reports a login attempt for threat analysis
pub async fn report_login_attempt(
    Extension(monitor): Extension<Arc<SecurityMonitor>>,
    Extension(ClientIp(ip_address)): Extension<ClientIp>,
    headers: HeaderMap,
    Json(request): Json<LoginAttemptRequest>,
) -> Json<LoginAttemptResponse> {
    let attempt = LoginAttempt {
        ip_address,
        user_id: request.user_id,
        clinic_id: request.clinic_id,
        user_agent: extract_user_agent(&headers),
        success: request.success,
        fingerprint: request.fingerprint.or_else(|| extract_device_fingerprint(&headers)),
    };

    // Analysis failures never block the login flow
    let threats = match monitor.analyze_login_attempt(&attempt).await {
        Ok(threats) => threats,
        Err(e) => {
            warn!(ip = %ip_address, "Login attempt analysis failed: {}", e);
            Vec::new()
        }
    };

    let mut mitigation = None;
    for threat in &threats {
        match monitor.handle_security_threat(threat).await {
            Ok(applied) => mitigation = mitigation.max(Some(applied)),
            Err(e) => warn!(threat_id = %threat.id, "Failed to apply mitigation: {}", e),
        }
    }

    Json(LoginAttemptResponse { threats, mitigation })
}

/// Issue a session for an identity the provider has already authenticated
pub async fn issue_session(
    Extension(session_manager): Extension<Arc<SessionManager>>,
    Extension(monitor): Extension<Arc<SecurityMonitor>>,
    Extension(ClientIp(ip_address)): Extension<ClientIp>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(request): Json<IssueSessionRequest>,
) -> Result<(StatusCode, CookieJar, Json<IssueSessionResponse>)> {
    let fingerprint = request.fingerprint.or_else(|| extract_device_fingerprint(&headers));
    let device_info = DeviceInfo {
        ip_address,
        user_agent: extract_user_agent(&headers),
        fingerprint: fingerprint.clone(),
    };

    let issued = session_manager
        .create_session(&request.user_id, &request.clinic_id, request.role, device_info)
        .await?;

    let device_trusted = match &fingerprint {
        Some(fp) => match monitor.is_device_trusted(&request.user_id, fp).await {
            Ok(trusted) => {
                if let Err(e) = monitor.record_device_use(&request.user_id, fp, false).await {
                    warn!(user_id = %request.user_id, "Failed to record device use: {}", e);
                }
                trusted
            }
            Err(e) => {
                warn!(user_id = %request.user_id, "Device trust lookup failed: {}", e);
                false
            }
        },
        None => false,
    };

    let config = session_manager.config();
    let cookie = create_secure_cookie(
        &config.cookie_name,
        &issued.token,
        config.absolute_lifetime().num_seconds(),
        config.cookie_secure,
    );

    let session = SessionSummary::of(&issued.session, session_manager.now());
    Ok((
        StatusCode::CREATED,
        jar.add(cookie),
        Json(IssueSessionResponse { session, device_trusted }),
    ))
}

/// Summary of the caller's own session
pub async fn current_session(
    Extension(session_manager): Extension<Arc<SessionManager>>,
    Extension(auth): Extension<AuthSession>,
) -> Result<Json<SessionSummary>> {
    // Prefer the refreshed record over the one captured before the refresh
    let session_id = auth.session_id().to_string();
    let session = session_manager.get_session(&session_id).await?.unwrap_or(auth.session);
    Ok(Json(SessionSummary::of(&session, session_manager.now())))
}

pub async fn logout(
    Extension(session_manager): Extension<Arc<SessionManager>>,
    Extension(auth): Extension<AuthSession>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<serde_json::Value>)> {
    session_manager.revoke_session(auth.session_id(), "logout").await?;
    info!(session_id = %auth.session_id(), user_id = %auth.user_id(), "User logged out");

    let config = session_manager.config();
    let jar = jar.add(create_delete_cookie(&config.cookie_name, config.cookie_secure));

    Ok((jar, Json(serde_json::json!({
        "message": "Logged out successfully"
    }))))
}
