use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{
    database::store::{device_key, session_key, token_key, user_sessions_key, CounterStore, SessionStore},
    errors::{AppError, Result},
    models::{DeviceFingerprint, Session, WindowSnapshot},
};

type RedisFuture<'a, T> = Pin<Box<dyn Future<Output = RedisResult<T>> + Send + 'a>>;

/// Redis connection manager with reconnect-and-retry and a per-call timeout
#[derive(Clone)]
pub struct RedisManager {
    connection_manager: Arc<RwLock<ConnectionManager>>,
    client: Client,
    call_timeout: Duration,
}

impl RedisManager {
    pub async fn new(redis_url: &str, call_timeout: Duration) -> Result<Self> {
        info!("Initializing Redis connection to: {}", redact_url(redis_url));

        let client = Client::open(redis_url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::store(format!("Redis client creation failed: {}", e))
        })?;

        let connection_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("Failed to create Redis connection manager: {}", e);
            AppError::store(format!("Redis connection failed: {}", e))
        })?;

        info!("Redis connection established successfully");

        Ok(Self {
            connection_manager: Arc::new(RwLock::new(connection_manager)),
            client,
            call_timeout,
        })
    }

    /// Reconnect to Redis if connection is lost. Returns the new connection.
    pub async fn reconnect(&self) -> Result<ConnectionManager> {
        warn!("Attempting to reconnect to Redis...");

        let new_connection = ConnectionManager::new(self.client.clone()).await.map_err(|e| {
            error!("Failed to reconnect to Redis: {}", e);
            AppError::store(format!("Redis reconnection failed: {}", e))
        })?;

        *self.connection_manager.write().await = new_connection.clone();

        info!("Redis reconnection successful");
        Ok(new_connection)
    }

    /// Execute a command with one reconnect-and-retry on failure. The lock is held
    /// only long enough to clone the connection.
    async fn execute_with_retry<F, T>(&self, operation: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut ConnectionManager) -> RedisFuture<'c, T> + Send + Sync,
        T: Send,
    {
        let conn = self.connection_manager.read().await.clone();
        with_retry(self.call_timeout, conn, operation, || self.reconnect()).await
    }

    async fn get_string(&self, key: String) -> Result<Option<String>> {
        self.execute_with_retry(|conn| {
            let key = key.clone();
            Box::pin(async move { conn.get(&key).await })
        })
        .await
    }

    async fn set_string(&self, key: String, value: String, ttl_seconds: Option<u64>) -> Result<()> {
        self.execute_with_retry(|conn| {
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move {
                match ttl_seconds {
                    Some(ttl) => conn.set_ex::<_, _, ()>(&key, &value, ttl.max(1)).await,
                    None => conn.set::<_, _, ()>(&key, &value).await,
                }
            })
        })
        .await
    }

    async fn ping_server(&self) -> Result<()> {
        self.execute_with_retry(|conn| {
            Box::pin(async move { redis::cmd("PING").query_async::<String>(conn).await })
        })
        .await
        .map(|_| ())
    }
}

/// Sliding windows and flags
#[async_trait]
impl CounterStore for RedisManager {
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_seconds: u64,
    ) -> Result<WindowSnapshot> {
        let floor = now_ms - window_ms;
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let (count, oldest): (u64, Vec<(String, f64)>) = self
            .execute_with_retry(|conn| {
                let key = key.to_string();
                let member = member.clone();
                Box::pin(async move {
                    redis::pipe()
                        .atomic()
                        .zrembyscore(&key, "-inf", floor)
                        .ignore()
                        .zadd(&key, &member, now_ms)
                        .ignore()
                        .zcard(&key)
                        .zrange_withscores(&key, 0, 0)
                        .expire(&key, ttl_seconds as i64)
                        .ignore()
                        .query_async(conn)
                        .await
                })
            })
            .await?;

        Ok(WindowSnapshot {
            count,
            oldest_ms: oldest.first().map(|(_, score)| *score as i64),
        })
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.get_string(key.to_string()).await
    }

    async fn set_value(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        self.set_string(key.to_string(), value.to_string(), ttl_seconds).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.execute_with_retry(|conn| {
            let keys = keys.to_vec();
            Box::pin(async move { conn.del::<_, ()>(keys).await })
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.execute_with_retry(|conn| {
            let key = key.to_string();
            Box::pin(async move { conn.exists(&key).await })
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.ping_server().await
    }
}

/// Session records, token bindings and device history
#[async_trait]
impl SessionStore for RedisManager {
    async fn put_session(&self, session: &Session, ttl_seconds: u64) -> Result<()> {
        let json = serde_json::to_string(session)?;
        self.set_string(session_key(&session.id), json, Some(ttl_seconds)).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        match self.get_string(session_key(session_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn bind_token(&self, token_hash: &str, session_id: &str, ttl_seconds: u64) -> Result<()> {
        self.set_string(token_key(token_hash), session_id.to_string(), Some(ttl_seconds)).await
    }

    async fn lookup_token(&self, token_hash: &str) -> Result<Option<String>> {
        self.get_string(token_key(token_hash)).await
    }

    async fn add_user_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.execute_with_retry(|conn| {
            let key = user_sessions_key(user_id);
            let session_id = session_id.to_string();
            Box::pin(async move { conn.sadd::<_, _, ()>(&key, &session_id).await })
        })
        .await
    }

    async fn remove_user_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.execute_with_retry(|conn| {
            let key = user_sessions_key(user_id);
            let session_id = session_id.to_string();
            Box::pin(async move { conn.srem::<_, _, ()>(&key, &session_id).await })
        })
        .await
    }

    async fn user_session_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.execute_with_retry(|conn| {
            let key = user_sessions_key(user_id);
            Box::pin(async move { conn.smembers(&key).await })
        })
        .await
    }

    async fn get_device(&self, user_id: &str, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        match self.get_string(device_key(user_id, fingerprint_hash)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_device(&self, user_id: &str, device: &DeviceFingerprint) -> Result<()> {
        let json = serde_json::to_string(device)?;
        self.set_string(device_key(user_id, &device.fingerprint_hash), json, None).await
    }

    async fn ping_sessions(&self) -> Result<()> {
        self.ping_server().await
    }
}

/// Runs `operation` on `conn`, then once more on a fresh connection if it fails.
/// The first attempt, the reconnect and the retry are each bounded by `call_timeout`;
/// a timed-out attempt is not retried.
async fn with_retry<C, T, F, R, RF>(call_timeout: Duration, mut conn: C, operation: F, reconnect: R) -> Result<T>
where
    C: Send,
    T: Send,
    F: for<'c> Fn(&'c mut C) -> RedisFuture<'c, T> + Send + Sync,
    R: FnOnce() -> RF + Send,
    RF: Future<Output = Result<C>> + Send,
{
    match tokio::time::timeout(call_timeout, operation(&mut conn)).await? {
        Ok(result) => Ok(result),
        Err(e) => {
            warn!("Redis operation failed, attempting reconnect: {}", e);
            let mut conn = tokio::time::timeout(call_timeout, reconnect()).await??;

            tokio::time::timeout(call_timeout, operation(&mut conn))
                .await?
                .map_err(|e| {
                    error!("Redis operation failed after reconnect: {}", e);
                    AppError::store(format!("Redis operation failed: {}", e))
                })
        }
    }
}

/// Hide the password component of a connection URL
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable redis url>".to_string(),
    }
}
