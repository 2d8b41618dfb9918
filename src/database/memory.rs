use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard,
};

use crate::{
    clock::{Clock, SharedClock},
    database::store::{device_key, session_key, token_key, user_sessions_key, CounterStore, SessionStore},
    errors::{AppError, Result},
    models::{DeviceFingerprint, Session, WindowSnapshot},
};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// (score, member), kept sorted by score
    ZSet(Vec<(i64, String)>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Full expiry sweep once per this many operations
const SWEEP_INTERVAL: u64 = 1024;

/// In-process store with TTLs driven by the injected clock.
///
/// Every operation runs under a single lock, so the window batch is as atomic
/// as its redis counterpart. Expired keys are dropped when touched and by a
/// periodic sweep.
#[derive(Debug)]
pub struct MemoryStore {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
    ops: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            ops: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> (MutexGuard<'_, HashMap<String, Entry>>, i64) {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            entries.retain(|_, entry| !entry.expired(now));
        }
        (entries, now)
    }

    /// Lock the map with `key` dropped if it has expired by now
    fn live(&self, key: &str) -> (MutexGuard<'_, HashMap<String, Entry>>, i64) {
        let (mut entries, now) = self.lock();
        if entries.get(key).is_some_and(|entry| entry.expired(now)) {
            entries.remove(key);
        }
        (entries, now)
    }

    fn expiry(now_ms: i64, ttl_seconds: Option<u64>) -> Option<i64> {
        ttl_seconds.map(|ttl| now_ms + (ttl as i64) * 1000)
    }

    fn put_string(&self, key: String, value: String, ttl_seconds: Option<u64>) {
        let (mut entries, now) = self.lock();
        entries.insert(key, Entry { value: Value::Str(value), expires_at_ms: Self::expiry(now, ttl_seconds) });
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let (entries, _) = self.live(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(AppError::store(format!("wrong type for key {}", key))),
        }
    }

    /// Remaining TTL of a key in seconds, for assertions
    pub fn ttl_seconds(&self, key: &str) -> Option<i64> {
        let (entries, now) = self.live(key);
        entries
            .get(key)
            .and_then(|e| e.expires_at_ms)
            .map(|at| (at - now + 999) / 1000)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let (entries, _) = self.live(key);
        entries.contains_key(key)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_seconds: u64,
    ) -> Result<WindowSnapshot> {
        let (mut entries, clock_now) = self.live(key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(Vec::new()),
            expires_at_ms: None,
        });

        let Value::ZSet(members) = &mut entry.value else {
            return Err(AppError::store(format!("wrong type for key {}", key)));
        };

        let floor = now_ms - window_ms;
        members.retain(|(score, _)| *score > floor);
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        let at = members.partition_point(|(score, _)| *score <= now_ms);
        members.insert(at, (now_ms, member));

        let snapshot = WindowSnapshot {
            count: members.len() as u64,
            oldest_ms: members.first().map(|(score, _)| *score),
        };
        entry.expires_at_ms = Self::expiry(clock_now, Some(ttl_seconds));
        Ok(snapshot)
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.get_string(key)
    }

    async fn set_value(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        self.put_string(key.to_string(), value.to_string(), ttl_seconds);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let (mut entries, _) = self.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains_key(key))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put_session(&self, session: &Session, ttl_seconds: u64) -> Result<()> {
        let json = serde_json::to_string(session)?;
        self.put_string(session_key(&session.id), json, Some(ttl_seconds));
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        match self.get_string(&session_key(session_id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn bind_token(&self, token_hash: &str, session_id: &str, ttl_seconds: u64) -> Result<()> {
        self.put_string(token_key(token_hash), session_id.to_string(), Some(ttl_seconds));
        Ok(())
    }

    async fn lookup_token(&self, token_hash: &str) -> Result<Option<String>> {
        self.get_string(&token_key(token_hash))
    }

    async fn add_user_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        let key = user_sessions_key(user_id);
        let (mut entries, _) = self.live(&key);
        let entry = entries.entry(key).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Value::Set(ids) => {
                ids.insert(session_id.to_string());
                Ok(())
            }
            _ => Err(AppError::store("wrong type for user session index")),
        }
    }

    async fn remove_user_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        let key = user_sessions_key(user_id);
        let (mut entries, _) = self.live(&key);
        if let Some(Entry { value: Value::Set(ids), .. }) = entries.get_mut(&key) {
            ids.remove(session_id);
        }
        Ok(())
    }

    async fn user_session_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let key = user_sessions_key(user_id);
        let (entries, _) = self.live(&key);
        match entries.get(&key).map(|e| &e.value) {
            Some(Value::Set(ids)) => Ok(ids.iter().cloned().collect()),
            Some(_) => Err(AppError::store("wrong type for user session index")),
            None => Ok(Vec::new()),
        }
    }

    async fn get_device(&self, user_id: &str, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        match self.get_string(&device_key(user_id, fingerprint_hash))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_device(&self, user_id: &str, device: &DeviceFingerprint) -> Result<()> {
        let json = serde_json::to_string(device)?;
        self.put_string(device_key(user_id, &device.fingerprint_hash), json, None);
        Ok(())
    }

    async fn ping_sessions(&self) -> Result<()> {
        Ok(())
    }
}

/// Store whose every call fails, for exercising degraded paths
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl UnavailableStore {
    fn fail<T>() -> Result<T> {
        Err(AppError::store("connection refused"))
    }
}

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn record_hit(&self, _: &str, _: i64, _: i64, _: u64) -> Result<WindowSnapshot> {
        Self::fail()
    }

    async fn get_value(&self, _: &str) -> Result<Option<String>> {
        Self::fail()
    }

    async fn set_value(&self, _: &str, _: &str, _: Option<u64>) -> Result<()> {
        Self::fail()
    }

    async fn delete(&self, _: &[String]) -> Result<()> {
        Self::fail()
    }

    async fn exists(&self, _: &str) -> Result<bool> {
        Self::fail()
    }

    async fn ping(&self) -> Result<()> {
        Self::fail()
    }
}

#[async_trait]
impl SessionStore for UnavailableStore {
    async fn put_session(&self, _: &Session, _: u64) -> Result<()> {
        Self::fail()
    }

    async fn get_session(&self, _: &str) -> Result<Option<Session>> {
        Self::fail()
    }

    async fn bind_token(&self, _: &str, _: &str, _: u64) -> Result<()> {
        Self::fail()
    }

    async fn lookup_token(&self, _: &str) -> Result<Option<String>> {
        Self::fail()
    }

    async fn add_user_session(&self, _: &str, _: &str) -> Result<()> {
        Self::fail()
    }

    async fn remove_user_session(&self, _: &str, _: &str) -> Result<()> {
        Self::fail()
    }

    async fn user_session_ids(&self, _: &str) -> Result<Vec<String>> {
        Self::fail()
    }

    async fn get_device(&self, _: &str, _: &str) -> Result<Option<DeviceFingerprint>> {
        Self::fail()
    }

    async fn put_device(&self, _: &str, _: &DeviceFingerprint) -> Result<()> {
        Self::fail()
    }

    async fn ping_sessions(&self) -> Result<()> {
        Self::fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_hit_purges_outside_window() {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        let store = MemoryStore::new(clock.clone());
        let now = clock.now_millis();

        let first = store.record_hit("k", now, 10_000, 70).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.oldest_ms, Some(now));

        let second = store.record_hit("k", now, 10_000, 70).await.unwrap();
        assert_eq!(second.count, 2, "same-millisecond hits are distinct members");

        clock.advance_secs(11);
        let third = store.record_hit("k", clock.now_millis(), 10_000, 70).await.unwrap();
        assert_eq!(third.count, 1);
        assert_eq!(third.oldest_ms, Some(clock.now_millis()));
    }

    #[tokio::test]
    async fn test_values_expire_with_clock() {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        let store = MemoryStore::new(clock.clone());

        store.set_value("flag", "1", Some(30)).await.unwrap();
        store.set_value("forever", "1", None).await.unwrap();
        assert_eq!(store.ttl_seconds("flag"), Some(30));

        clock.advance_secs(31);
        assert!(!store.exists("flag").await.unwrap());
        assert!(store.exists("forever").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_dropped_on_access_only() {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        let store = MemoryStore::new(clock.clone());
        store.set_value("a", "1", Some(10)).await.unwrap();
        store.set_value("b", "1", Some(10)).await.unwrap();

        clock.advance_secs(11);
        assert_eq!(store.get_value("a").await.unwrap(), None);
        assert_eq!(store.ttl_seconds("b"), None);

        store.set_value("c", "1", Some(10)).await.unwrap();
        let entries = store.entries.lock().unwrap();
        assert!(!entries.contains_key("a"));
        assert!(!entries.contains_key("b"));
        assert!(entries.contains_key("c"));
    }

    #[tokio::test]
    async fn test_sweep_clears_untouched_expired_keys() {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        let store = MemoryStore::new(clock.clone());
        store.set_value("stale", "1", Some(10)).await.unwrap();
        store.set_value("kept", "1", None).await.unwrap();

        clock.advance_secs(11);
        store.exists("other").await.unwrap();
        assert!(store.entries.lock().unwrap().contains_key("stale"));

        for _ in 0..SWEEP_INTERVAL {
            store.exists("other").await.unwrap();
        }
        let entries = store.entries.lock().unwrap();
        assert!(!entries.contains_key("stale"));
        assert!(entries.contains_key("kept"));
    }

    #[tokio::test]
    async fn test_user_session_index() {
        let clock = Arc::new(ManualClock::at_epoch_plus(0));
        let store = MemoryStore::new(clock);
        store.add_user_session("u1", "a").await.unwrap();
        store.add_user_session("u1", "b").await.unwrap();
        store.remove_user_session("u1", "a").await.unwrap();
        assert_eq!(store.user_session_ids("u1").await.unwrap(), vec!["b".to_string()]);
        assert!(store.user_session_ids("nobody").await.unwrap().is_empty());
    }
}
