use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::errors::AppError;

/// How long an ended session record is kept for audit before the store drops it
pub const SESSION_RETENTION_SECONDS: i64 = 3600;

/// Caller role, resolved once at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Staff,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "staff" => Ok(Role::Staff),
            "viewer" => Ok(Role::Viewer),
            other => Err(AppError::bad_request(format!("unknown role '{}'", other))),
        }
    }
}

/// Client characteristics captured when a session is issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub ip_address: IpAddr,
    pub user_agent: String,
    /// Raw client fingerprint, when the client supplies one
    pub fingerprint: Option<String>,
}

/// Session record with its two independent expiry clocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub clinic_id: String,
    pub role: Role,
    pub device_info: DeviceInfo,
    /// Last IP seen on a refresh
    pub last_ip: IpAddr,
    /// SHA-256 of the issued token. The token itself is never stored.
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub idle_timeout_at: DateTime<Utc>,
    pub absolute_timeout_at: DateTime<Utc>,
    /// Idle window fixed at creation from the role in force then
    pub idle_window_seconds: i64,
    pub is_active: bool,
    #[serde(default)]
    pub revoked_reason: Option<String>,
}

/// Lifecycle states. Everything except `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    IdleExpired,
    AbsoluteExpired,
    Revoked,
}

impl Session {
    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if !self.is_active {
            SessionState::Revoked
        } else if now >= self.idle_timeout_at {
            SessionState::IdleExpired
        } else if now >= self.absolute_timeout_at {
            SessionState::AbsoluteExpired
        } else {
            SessionState::Active
        }
    }

    pub fn idle_window(&self) -> Duration {
        Duration::seconds(self.idle_window_seconds)
    }

    /// Record activity, pushing the idle deadline out. The absolute deadline never moves.
    pub fn touch(&mut self, now: DateTime<Utc>, ip_address: IpAddr) {
        self.last_activity_at = now;
        self.idle_timeout_at = now + self.idle_window();
        self.last_ip = ip_address;
    }

    pub fn revoke(&mut self, reason: &str) {
        self.is_active = false;
        self.revoked_reason = Some(reason.to_string());
    }

    /// Seconds the record should stay in the store: the rest of its lifetime plus retention
    pub fn store_ttl(&self, now: DateTime<Utc>) -> u64 {
        let remaining = (self.absolute_timeout_at - now).num_seconds().max(0);
        (remaining + SESSION_RETENTION_SECONDS) as u64
    }
}

/// Stable, non-enumerable reason codes for a failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    InvalidToken,
    SessionExpired,
    IdleTimeout,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::InvalidToken => "invalid_token",
            ValidationReason::SessionExpired => "session_expired",
            ValidationReason::IdleTimeout => "idle_timeout",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionValidation {
    pub is_valid: bool,
    pub session: Option<Session>,
    pub reason: Option<ValidationReason>,
}

impl SessionValidation {
    pub fn valid(session: Session) -> Self {
        Self { is_valid: true, session: Some(session), reason: None }
    }

    pub fn invalid(reason: ValidationReason) -> Self {
        Self { is_valid: false, session: None, reason: Some(reason) }
    }
}

/// A freshly created session together with the only copy of its token
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub token: String,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_minutes_admin: i64,
    pub idle_minutes_staff: i64,
    pub idle_minutes_viewer: i64,
    /// Absolute lifetime in hours
    pub absolute_hours: i64,
    /// Maximum concurrent sessions per user
    pub max_concurrent_sessions: usize,
    pub cookie_name: String,
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_minutes_admin: 60,
            idle_minutes_staff: 30,
            idle_minutes_viewer: 15,
            absolute_hours: 12,
            max_concurrent_sessions: 3,
            cookie_name: "session_token".to_string(),
            cookie_secure: true,
        }
    }
}

impl SessionConfig {
    pub fn idle_window(&self, role: Role) -> Duration {
        let minutes = match role {
            Role::Admin => self.idle_minutes_admin,
            Role::Staff => self.idle_minutes_staff,
            Role::Viewer => self.idle_minutes_viewer,
        };
        Duration::minutes(minutes)
    }

    pub fn absolute_lifetime(&self) -> Duration {
        Duration::hours(self.absolute_hours)
    }
}

/// Public projection of a session for API responses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub user_id: String,
    pub clinic_id: String,
    pub role: Role,
    pub ip_address: IpAddr,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub idle_timeout_at: DateTime<Utc>,
    pub absolute_timeout_at: DateTime<Utc>,
    pub state: SessionState,
}

impl SessionSummary {
    pub fn of(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            clinic_id: session.clinic_id.clone(),
            role: session.role,
            ip_address: session.device_info.ip_address,
            user_agent: session.device_info.user_agent.clone(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            idle_timeout_at: session.idle_timeout_at,
            absolute_timeout_at: session.absolute_timeout_at,
            state: session.state_at(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> Session {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        Session {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            clinic_id: "c1".to_string(),
            role: Role::Viewer,
            device_info: DeviceInfo { ip_address: ip, user_agent: "Mozilla/5.0".to_string(), fingerprint: None },
            last_ip: ip,
            token_hash: "h".to_string(),
            created_at: now,
            last_activity_at: now,
            idle_timeout_at: now + Duration::minutes(15),
            absolute_timeout_at: now + Duration::hours(1),
            idle_window_seconds: 900,
            is_active: true,
            revoked_reason: None,
        }
    }

    #[test]
    fn test_state_machine() {
        let now = Utc::now();
        let mut session = sample(now);
        assert_eq!(session.state_at(now), SessionState::Active);
        assert_eq!(session.state_at(now + Duration::minutes(15)), SessionState::IdleExpired);

        session.touch(now + Duration::minutes(55), session.last_ip);
        assert_eq!(session.state_at(now + Duration::minutes(61)), SessionState::AbsoluteExpired);

        session.revoke("logout");
        assert_eq!(session.state_at(now), SessionState::Revoked);
    }

    #[test]
    fn test_touch_never_moves_absolute_deadline() {
        let now = Utc::now();
        let mut session = sample(now);
        let absolute = session.absolute_timeout_at;
        session.touch(now + Duration::minutes(10), session.last_ip);
        assert_eq!(session.absolute_timeout_at, absolute);
        assert_eq!(session.idle_timeout_at, now + Duration::minutes(25));
    }

    #[test]
    fn test_role_idle_windows() {
        let config = SessionConfig::default();
        assert_eq!(config.idle_window(Role::Admin), Duration::minutes(60));
        assert_eq!(config.idle_window(Role::Staff), Duration::minutes(30));
        assert_eq!(config.idle_window(Role::Viewer), Duration::minutes(15));
        assert_eq!("Staff".parse::<Role>().unwrap(), Role::Staff);
    }
}
