use axum::{
    extract::{Extension, Request},
    http::{HeaderMap, HeaderValue, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::{
    auth::{
        ses::SessionManager,
        threat::SecurityMonitor,
        utils::{extract_client_ip, extract_device_fingerprint, extract_user_agent, TrustedProxies},
    },
    errors::{AppError, Result},
    middleware::rate::RateLimiter,
    models::{
        rate::{LimitType, RateLimitDecision},
        security::{Mitigation, ObservedActivity, ThreatEvent},
        ses::{Role, Session},
    },
};

/// Validated session attached to the request for handlers
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub session: Session,
}

impl AuthSession {
    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.session.role == role
    }
}

/// Client address as resolved by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// How the gateway treats a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// No rate limit, no session
    Exempt,
    /// Rate limited, no session required
    Public(LimitType),
    /// Rate limited and requires a live session
    Protected { limit_type: LimitType, admin_only: bool },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub login_path: String,
    pub unauthorized_path: String,
    pub cookie_name: String,
    pub cookie_secure: bool,
    /// Upper bound on threat analysis. Mitigations are not bounded by it.
    pub monitor_timeout: Duration,
    pub trusted_proxies: TrustedProxies,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            unauthorized_path: "/unauthorized".to_string(),
            cookie_name: "session_token".to_string(),
            cookie_secure: true,
            monitor_timeout: Duration::from_millis(200),
            trusted_proxies: TrustedProxies::default(),
        }
    }
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

impl GatewayConfig {
    pub fn classify(&self, path: &str) -> RouteClass {
        if path == "/health" {
            RouteClass::Exempt
        } else if path.starts_with("/auth/login") {
            RouteClass::Public(LimitType::LoginAttempts)
        } else if path.starts_with("/auth/mfa") {
            RouteClass::Public(LimitType::MfaAttempts)
        } else if path == self.login_path || path == self.unauthorized_path {
            // Redirect targets must stay reachable without a session
            RouteClass::Public(LimitType::ApiCalls)
        } else {
            RouteClass::Protected {
                limit_type: LimitType::ApiCalls,
                admin_only: under(path, "/admin"),
            }
        }
    }
}

/// Runs rate limiting, session validation and threat analysis, in that order
pub struct Gateway {
    rate_limiter: Arc<RateLimiter>,
    session_manager: Arc<SessionManager>,
    monitor: Arc<SecurityMonitor>,
    config: GatewayConfig,
}

enum SessionCheck {
    Live(Session),
    Rejected,
    Unavailable(AppError),
}

impl Gateway {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        session_manager: Arc<SessionManager>,
        monitor: Arc<SecurityMonitor>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            rate_limiter,
            session_manager,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn check_session(&self, token: &str) -> SessionCheck {
        match self.session_manager.validate_session(token).await {
            Ok(validation) => match validation.session {
                Some(session) if validation.is_valid => SessionCheck::Live(session),
                _ => {
                    debug!(reason = ?validation.reason, "Session rejected at gateway");
                    SessionCheck::Rejected
                }
            },
            Err(e) if e.is_store_fault() => SessionCheck::Unavailable(e),
            Err(e) => {
                warn!("Unreadable session rejected at gateway: {}", e);
                SessionCheck::Rejected
            }
        }
    }

    async fn analyze_with_timeout(&self, session: &Session, observed: &ObservedActivity) -> Vec<ThreatEvent> {
        let analysis = self.monitor.analyze_session_activity(session, observed);
        match tokio::time::timeout(self.config.monitor_timeout, analysis).await {
            Ok(Ok(threats)) => threats,
            Ok(Err(e)) => {
                warn!(session_id = %session.id, "Threat analysis failed, continuing: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    session_id = %session.id,
                    timeout_ms = self.config.monitor_timeout.as_millis() as u64,
                    "Threat analysis timed out, continuing"
                );
                Vec::new()
            }
        }
    }

    /// Apply the mitigation of every threat and return the strongest one called for.
    ///
    /// Mitigations run on their own task, so they complete even if the request
    /// is dropped. The result does not depend on whether applying them succeeded.
    async fn mitigate(&self, threats: Vec<ThreatEvent>) -> Option<Mitigation> {
        let strongest = threats.iter().map(|t| Mitigation::for_severity(t.severity)).max()?;

        let monitor = self.monitor.clone();
        let task = tokio::spawn(async move {
            for threat in &threats {
                if let Err(e) = monitor.handle_security_threat(threat).await {
                    error!(threat_id = %threat.id, "Failed to apply mitigation: {}", e);
                }
            }
        });
        if let Err(e) = task.await {
            error!("Mitigation task aborted: {}", e);
        }

        Some(strongest)
    }

    fn login_redirect(&self, jar: CookieJar, uri: &Uri) -> Response {
        let original = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("redirectTo", original)
            .finish();
        let target = format!("{}?{}", self.config.login_path, query);
        let jar = jar.remove(Cookie::build((self.config.cookie_name.clone(), "")).path("/"));
        (jar, Redirect::to(&target)).into_response()
    }

    fn unauthorized_redirect(&self) -> Response {
        Redirect::to(&self.config.unauthorized_path).into_response()
    }
}

/// Gateway middleware. Short-circuits on the first deny.
pub async fn gateway_middleware(
    Extension(gateway): Extension<Arc<Gateway>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let route = gateway.config.classify(request.uri().path());
    let limit_type = match route {
        RouteClass::Exempt => return next.run(request).await,
        RouteClass::Public(limit_type) | RouteClass::Protected { limit_type, .. } => limit_type,
    };

    // 1. Rate limit on the client address
    let ip = extract_client_ip(&request, &gateway.config.trusted_proxies);
    let decision = gateway.rate_limiter.check_rate_limit(limit_type, &ip.to_string()).await;
    if !decision.allowed {
        warn!(limit_type = %limit_type, ip = %ip, "Request rate limited at gateway");
        return rate_limited_response(&decision);
    }

    request.extensions_mut().insert(ClientIp(ip));

    let RouteClass::Protected { admin_only, .. } = route else {
        let mut response = next.run(request).await;
        apply_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    };

    // 2. Session validity
    let Some(token) = jar.get(&gateway.config.cookie_name).map(|c| c.value().to_string()) else {
        return gateway.login_redirect(jar, request.uri());
    };
    let session = match gateway.check_session(&token).await {
        SessionCheck::Live(session) => session,
        SessionCheck::Rejected => return gateway.login_redirect(jar, request.uri()),
        SessionCheck::Unavailable(e) => {
            error!(ip = %ip, "Session store unavailable, denying request: {}", e);
            return e.into_response();
        }
    };

    if admin_only && !matches!(session.role, Role::Admin) {
        warn!(
            session_id = %session.id,
            user_id = %session.user_id,
            role = %session.role,
            path = %request.uri().path(),
            "Role not permitted"
        );
        return gateway.unauthorized_redirect();
    }

    // 3. Threat analysis, only once the session is known to exist
    let observed = ObservedActivity {
        ip_address: ip,
        user_agent: extract_user_agent(request.headers()),
        fingerprint: extract_device_fingerprint(request.headers()),
    };
    let threats = gateway.analyze_with_timeout(&session, &observed).await;
    match gateway.mitigate(threats).await {
        Some(Mitigation::TerminateSession) => return gateway.login_redirect(jar, request.uri()),
        Some(Mitigation::BlockIp) => {
            if let Some(response) = blocked_response(&gateway.rate_limiter, limit_type, ip).await {
                return response;
            }
        }
        _ => {}
    }

    if let Err(e) = gateway.session_manager.refresh_session(&token, ip).await {
        warn!(session_id = %session.id, "Session refresh failed: {}", e);
    }
    let idle_expires = (gateway.session_manager.now() + session.idle_window()).timestamp();

    request.extensions_mut().insert(AuthSession { session });
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, &decision);
    headers.insert("X-Session-Idle-Expires", HeaderValue::from(idle_expires));
    response
}

async fn blocked_response(rate_limiter: &RateLimiter, limit_type: LimitType, ip: IpAddr) -> Option<Response> {
    let decision = rate_limiter.check_rate_limit(limit_type, &ip.to_string()).await;
    (!decision.allowed).then(|| rate_limited_response(&decision))
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_time));
}

fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let mut response = AppError::RateLimited {
        retry_after: decision.retry_after.unwrap_or(1),
        block_level: decision.block_level,
    }
    .into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

/// Helper function to create secure session cookie attributes
pub fn create_secure_cookie(name: &str, value: &str, max_age_seconds: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_string(), value.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age_seconds))
        .path("/")
        .build()
}

/// Helper function to create a cookie for deletion (expires immediately)
pub fn create_delete_cookie(name: &str, secure: bool) -> Cookie<'static> {
    create_secure_cookie(name, "", 0, secure)
}
