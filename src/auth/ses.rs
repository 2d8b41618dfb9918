use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    auth::utils::{generate_secure_token, sha256_hash},
    clock::{Clock, SharedClock},
    database::SessionStore,
    errors::{AppError, Result},
    middleware::rate::RateLimiter,
    models::{
        rate::LimitType,
        security::DeviceFingerprint,
        ses::{DeviceInfo, IssuedSession, Role, Session, SessionConfig, SessionState, SessionValidation, ValidationReason},
    },
};

const TOKEN_BYTES: usize = 32;

/// Issues, validates, refreshes and revokes sessions
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    config: SessionConfig,
    clock: SharedClock,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        rate_limiter: Arc<RateLimiter>,
        config: SessionConfig,
        clock: SharedClock,
    ) -> Self {
        Self { store, rate_limiter, config, clock }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a session for an authenticated identity.
    ///
    /// Gated by the `session_creation` limit keyed on the user. When the user is at
    /// the concurrency cap, the least-recently-active session is revoked first.
    pub async fn create_session(
        &self,
        user_id: &str,
        clinic_id: &str,
        role: Role,
        device_info: DeviceInfo,
    ) -> Result<IssuedSession> {
        let decision = self
            .rate_limiter
            .check_rate_limit(LimitType::SessionCreation, user_id)
            .await;
        if !decision.allowed {
            warn!(user_id = %user_id, "Session creation rate limited");
            return Err(AppError::RateLimited {
                retry_after: decision.retry_after.unwrap_or(1),
                block_level: decision.block_level,
            });
        }

        self.enforce_session_cap(user_id).await?;

        let now = self.clock.now();
        let token = generate_secure_token(TOKEN_BYTES);
        let idle_window = self.config.idle_window(role);
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            clinic_id: clinic_id.to_string(),
            role,
            last_ip: device_info.ip_address,
            device_info,
            token_hash: sha256_hash(&token),
            created_at: now,
            last_activity_at: now,
            idle_timeout_at: now + idle_window,
            absolute_timeout_at: now + self.config.absolute_lifetime(),
            idle_window_seconds: idle_window.num_seconds(),
            is_active: true,
            revoked_reason: None,
        };

        let ttl = session.store_ttl(now);
        self.store.put_session(&session, ttl).await?;
        self.store.bind_token(&session.token_hash, &session.id, ttl).await?;
        self.store.add_user_session(user_id, &session.id).await?;

        info!(
            session_id = %session.id,
            user_id = %user_id,
            clinic_id = %clinic_id,
            role = %role,
            "Session created"
        );

        Ok(IssuedSession { session, token })
    }

    /// Revoke least-recently-active sessions until there is room for one more
    async fn enforce_session_cap(&self, user_id: &str) -> Result<()> {
        let max = self.config.max_concurrent_sessions.max(1);
        let mut active = self.list_user_sessions(user_id).await?;

        while active.len() >= max {
            let Some(oldest_idx) = active
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_activity_at)
                .map(|(i, _)| i)
            else {
                break;
            };
            let evicted = active.swap_remove(oldest_idx);
            info!(
                session_id = %evicted.id,
                user_id = %user_id,
                "Evicting least recently active session"
            );
            self.revoke_session(&evicted.id, "concurrent_session_limit").await?;
        }
        Ok(())
    }

    /// Validate an opaque token.
    ///
    /// The token is only ever hashed and looked up, whatever it contains. Store
    /// failures are returned as errors so the caller denies.
    pub async fn validate_session(&self, token: &str) -> Result<SessionValidation> {
        let token_hash = sha256_hash(token);

        let Some(session_id) = self.store.lookup_token(&token_hash).await? else {
            return Ok(SessionValidation::invalid(ValidationReason::InvalidToken));
        };

        let Some(session) = self.store.get_session(&session_id).await? else {
            return Ok(SessionValidation::invalid(ValidationReason::InvalidToken));
        };

        if session.token_hash != token_hash {
            return Ok(SessionValidation::invalid(ValidationReason::InvalidToken));
        }

        let result = match session.state_at(self.clock.now()) {
            SessionState::Active => SessionValidation::valid(session),
            SessionState::Revoked | SessionState::AbsoluteExpired => {
                SessionValidation::invalid(ValidationReason::SessionExpired)
            }
            SessionState::IdleExpired => SessionValidation::invalid(ValidationReason::IdleTimeout),
        };

        if let Some(reason) = result.reason {
            debug!(session_id = %session_id, reason = %reason, "Session rejected");
        }
        Ok(result)
    }

    /// Extend the idle deadline of a live session. Never touches the absolute deadline.
    pub async fn refresh_session(&self, token: &str, ip_address: IpAddr) -> Result<()> {
        let validation = self.validate_session(token).await?;
        let Some(mut session) = validation.session else {
            return Err(AppError::Unauthorized);
        };

        let now = self.clock.now();
        session.touch(now, ip_address);
        self.store.put_session(&session, session.store_ttl(now)).await?;

        debug!(session_id = %session.id, idle_timeout_at = %session.idle_timeout_at, "Session refreshed");
        Ok(())
    }

    /// Revoke a session. Returns false when it was unknown or already inactive.
    ///
    /// The record and its token binding stay until retention ends, so a revoked
    /// token keeps resolving to `session_expired`.
    pub async fn revoke_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(false);
        };
        if !session.is_active {
            return Ok(false);
        }

        let now = self.clock.now();
        session.revoke(reason);
        self.store.put_session(&session, session.store_ttl(now)).await?;
        self.store.remove_user_session(&session.user_id, &session.id).await?;

        info!(session_id = %session_id, user_id = %session.user_id, reason = %reason, "Session revoked");
        Ok(true)
    }

    /// Revoke every live session of a user, returning how many were revoked
    pub async fn revoke_user_sessions(&self, user_id: &str, reason: &str) -> Result<usize> {
        let mut revoked = 0;
        for session in self.list_user_sessions(user_id).await? {
            if self.revoke_session(&session.id, reason).await? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    pub fn state_of(&self, session: &Session) -> SessionState {
        session.state_at(self.clock.now())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.store.get_session(session_id).await
    }

    /// Live sessions of a user. Index entries whose session is gone or no longer
    /// active are pruned on the way.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let now = self.clock.now();
        let mut sessions = Vec::new();

        for id in self.store.user_session_ids(user_id).await? {
            match self.store.get_session(&id).await? {
                Some(session) if session.state_at(now) == SessionState::Active => sessions.push(session),
                _ => {
                    debug!(session_id = %id, user_id = %user_id, "Pruning stale session index entry");
                    self.store.remove_user_session(user_id, &id).await?;
                }
            }
        }
        Ok(sessions)
    }

    pub async fn get_device(&self, user_id: &str, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        self.store.get_device(user_id, fingerprint_hash).await
    }

    pub async fn save_device(&self, user_id: &str, device: &DeviceFingerprint) -> Result<()> {
        self.store.put_device(user_id, device).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.ping_sessions().await
    }
}
