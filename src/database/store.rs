use async_trait::async_trait;

use crate::errors::Result;
use crate::models::{DeviceFingerprint, Session, WindowSnapshot};

/// Atomic counter store backing the rate limiter and the monitor's failure counters.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Purge entries older than `now_ms - window_ms`, insert one entry at `now_ms`,
    /// read the cardinality and the oldest score, and refresh the key TTL, as one
    /// atomic batch.
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_seconds: u64,
    ) -> Result<WindowSnapshot>;

    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    async fn set_value(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// Persistent session store, kept separate from the counter store.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn put_session(&self, session: &Session, ttl_seconds: u64) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    async fn bind_token(&self, token_hash: &str, session_id: &str, ttl_seconds: u64) -> Result<()>;

    async fn lookup_token(&self, token_hash: &str) -> Result<Option<String>>;

    async fn add_user_session(&self, user_id: &str, session_id: &str) -> Result<()>;

    async fn remove_user_session(&self, user_id: &str, session_id: &str) -> Result<()>;

    async fn user_session_ids(&self, user_id: &str) -> Result<Vec<String>>;

    async fn get_device(&self, user_id: &str, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>>;

    async fn put_device(&self, user_id: &str, device: &DeviceFingerprint) -> Result<()>;

    async fn ping_sessions(&self) -> Result<()>;
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn token_key(token_hash: &str) -> String {
    format!("session_token:{}", token_hash)
}

pub fn user_sessions_key(user_id: &str) -> String {
    format!("user_sessions:{}", user_id)
}

pub fn device_key(user_id: &str, fingerprint_hash: &str) -> String {
    format!("device:{}:{}", user_id, fingerprint_hash)
}
