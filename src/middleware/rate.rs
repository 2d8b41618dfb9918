use std::{net::IpAddr, sync::Arc};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Clock, SharedClock},
    database::CounterStore,
    errors::Result,
    models::rate::{
        block_key, ceil_secs, escalation_key, whitelist_key, window_key, BlockState, DecisionOutcome,
        EscalationState, LimitType, RateLimitConfig, RateLimitDecision, RateLimitPolicy, RateLimitStatus,
        ESCALATION_TTL_SECONDS,
    },
};

/// Sliding-window limiter with escalating blocks, keyed by (limit type, identifier)
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig, clock: SharedClock) -> Self {
        Self { store, config, clock }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn policy(&self, limit_type: LimitType) -> &RateLimitPolicy {
        self.config.policy(limit_type)
    }

    /// Count one event and decide. Store failures degrade to an allow and are logged,
    /// never returned.
    pub async fn check_rate_limit(&self, limit_type: LimitType, identifier: &str) -> RateLimitDecision {
        match self.evaluate(limit_type, identifier).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    limit_type = %limit_type,
                    identifier = %identifier,
                    "Rate limiter store error, allowing request: {}",
                    e
                );
                RateLimitDecision::degraded(self.clock.now_millis())
            }
        }
    }

    async fn evaluate(&self, limit_type: LimitType, identifier: &str) -> Result<RateLimitDecision> {
        let policy = self.policy(limit_type);
        let now = self.clock.now_millis();
        let window_ms = (policy.window_seconds as i64) * 1000;

        if self.is_whitelisted(limit_type, identifier).await? {
            debug!(limit_type = %limit_type, identifier = %identifier, "Whitelisted identifier bypassing limits");
            return Ok(RateLimitDecision {
                allowed: true,
                limit: policy.max_requests,
                remaining: policy.max_requests,
                reset_time: ceil_secs(now + window_ms),
                retry_after: None,
                block_level: None,
                escalated: false,
                outcome: DecisionOutcome::Whitelisted,
            });
        }

        if let Some(block) = self.active_block(limit_type, identifier, now).await? {
            debug!(
                limit_type = %limit_type,
                identifier = %identifier,
                level = block.level,
                "Request rejected by active block"
            );
            return Ok(RateLimitDecision {
                allowed: false,
                limit: policy.max_requests,
                remaining: 0,
                reset_time: ceil_secs(block.unblock_time),
                retry_after: Some(block.retry_after(now).max(1)),
                block_level: Some(block.level),
                escalated: false,
                outcome: DecisionOutcome::Blocked,
            });
        }

        let snapshot = self
            .store
            .record_hit(
                &window_key(limit_type, identifier),
                now,
                window_ms,
                policy.window_seconds + self.config.slack_seconds,
            )
            .await?;

        let oldest = snapshot.oldest_ms.unwrap_or(now);
        let max = u64::from(policy.max_requests);

        if snapshot.count <= max {
            return Ok(RateLimitDecision {
                allowed: true,
                limit: policy.max_requests,
                remaining: (max - snapshot.count) as u32,
                reset_time: ceil_secs(oldest + window_ms),
                retry_after: None,
                block_level: None,
                escalated: false,
                outcome: DecisionOutcome::Allowed,
            });
        }

        if !policy.is_block_capable() {
            let retry_after = ceil_secs(oldest + window_ms - now).max(1);
            warn!(
                limit_type = %limit_type,
                identifier = %identifier,
                count = snapshot.count,
                "Rate limit exceeded"
            );
            return Ok(RateLimitDecision {
                allowed: false,
                limit: policy.max_requests,
                remaining: 0,
                reset_time: ceil_secs(oldest + window_ms),
                retry_after: Some(retry_after),
                block_level: None,
                escalated: false,
                outcome: DecisionOutcome::Denied,
            });
        }

        self.escalate(limit_type, identifier, policy, now).await
    }

    /// Violation on a block-capable type: bump escalation, write the block, clear the window
    async fn escalate(
        &self,
        limit_type: LimitType,
        identifier: &str,
        policy: &RateLimitPolicy,
        now: i64,
    ) -> Result<RateLimitDecision> {
        let previous = self.escalation(limit_type, identifier).await?;
        let level = previous
            .map(|e| e.level.saturating_add(1))
            .unwrap_or(0)
            .min(policy.max_level());

        let duration = policy.block_duration(level).unwrap_or(0);
        let block = BlockState {
            level,
            block_time: now,
            unblock_time: now + (duration as i64) * 1000,
            identifier: identifier.to_string(),
            limit_type,
            reason: "rate_limit_exceeded".to_string(),
        };

        self.store
            .set_value(
                &block_key(limit_type, identifier),
                &serde_json::to_string(&block)?,
                Some(duration + self.config.slack_seconds),
            )
            .await?;

        let escalation = EscalationState { level, last_escalation: now };
        self.store
            .set_value(
                &escalation_key(limit_type, identifier),
                &serde_json::to_string(&escalation)?,
                Some(ESCALATION_TTL_SECONDS),
            )
            .await?;

        self.store.delete(&[window_key(limit_type, identifier)]).await?;

        warn!(
            limit_type = %limit_type,
            identifier = %identifier,
            level = level,
            block_seconds = duration,
            "Rate limit exceeded, block issued"
        );

        Ok(RateLimitDecision {
            allowed: false,
            limit: policy.max_requests,
            remaining: 0,
            reset_time: ceil_secs(block.unblock_time),
            retry_after: Some(duration),
            block_level: Some(level),
            escalated: true,
            outcome: DecisionOutcome::Denied,
        })
    }

    async fn active_block(&self, limit_type: LimitType, identifier: &str, now: i64) -> Result<Option<BlockState>> {
        let key = block_key(limit_type, identifier);
        let Some(raw) = self.store.get_value(&key).await? else {
            return Ok(None);
        };

        let block: BlockState = serde_json::from_str(&raw)?;
        if block.is_active(now) {
            Ok(Some(block))
        } else {
            // Expired but still inside its slack TTL
            self.store.delete(&[key]).await?;
            Ok(None)
        }
    }

    async fn escalation(&self, limit_type: LimitType, identifier: &str) -> Result<Option<EscalationState>> {
        match self.store.get_value(&escalation_key(limit_type, identifier)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Administrative block path. Keeps the current escalation level without raising it.
    pub async fn block(
        &self,
        limit_type: LimitType,
        identifier: &str,
        duration_seconds: u64,
        reason: &str,
    ) -> Result<BlockState> {
        let now = self.clock.now_millis();
        let level = self
            .escalation(limit_type, identifier)
            .await?
            .map(|e| e.level)
            .unwrap_or(0);

        let block = BlockState {
            level,
            block_time: now,
            unblock_time: now + (duration_seconds as i64) * 1000,
            identifier: identifier.to_string(),
            limit_type,
            reason: reason.to_string(),
        };

        self.store
            .set_value(
                &block_key(limit_type, identifier),
                &serde_json::to_string(&block)?,
                Some(duration_seconds + self.config.slack_seconds),
            )
            .await?;

        info!(
            limit_type = %limit_type,
            identifier = %identifier,
            duration_seconds = duration_seconds,
            reason = %reason,
            "Identifier blocked"
        );
        Ok(block)
    }

    /// Block an address on every IP-keyed limit type
    pub async fn block_ip(&self, ip: IpAddr, duration_seconds: u64, reason: &str) -> Result<()> {
        let identifier = ip.to_string();
        for limit_type in LimitType::ALL.into_iter().filter(LimitType::is_ip_keyed) {
            self.block(limit_type, &identifier, duration_seconds, reason).await?;
        }
        Ok(())
    }

    /// Clear window, block and escalation state for a key
    pub async fn reset(&self, limit_type: LimitType, identifier: &str) -> Result<()> {
        self.store
            .delete(&[
                window_key(limit_type, identifier),
                block_key(limit_type, identifier),
                escalation_key(limit_type, identifier),
            ])
            .await?;
        info!(limit_type = %limit_type, identifier = %identifier, "Rate limit state reset");
        Ok(())
    }

    pub async fn add_to_whitelist(
        &self,
        limit_type: LimitType,
        identifier: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<()> {
        self.store
            .set_value(&whitelist_key(limit_type, identifier), "1", ttl_seconds)
            .await?;
        info!(limit_type = %limit_type, identifier = %identifier, ?ttl_seconds, "Identifier whitelisted");
        Ok(())
    }

    pub async fn remove_from_whitelist(&self, limit_type: LimitType, identifier: &str) -> Result<()> {
        self.store.delete(&[whitelist_key(limit_type, identifier)]).await?;
        info!(limit_type = %limit_type, identifier = %identifier, "Identifier removed from whitelist");
        Ok(())
    }

    pub async fn is_whitelisted(&self, limit_type: LimitType, identifier: &str) -> Result<bool> {
        self.store.exists(&whitelist_key(limit_type, identifier)).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Read-only view of a key for support tooling
    pub async fn status(&self, limit_type: LimitType, identifier: &str) -> Result<RateLimitStatus> {
        let now = self.clock.now_millis();
        let block = match self.store.get_value(&block_key(limit_type, identifier)).await? {
            Some(raw) => Some(serde_json::from_str::<BlockState>(&raw)?).filter(|b| b.is_active(now)),
            None => None,
        };

        Ok(RateLimitStatus {
            limit_type,
            identifier: identifier.to_string(),
            whitelisted: self.is_whitelisted(limit_type, identifier).await?,
            block,
            escalation: self.escalation(limit_type, identifier).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        database::{MemoryStore, UnavailableStore},
    };

    fn limiter() -> (RateLimiter, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default(), clock.clone());
        (limiter, clock, store)
    }

    const IP: &str = "203.0.113.1";

    #[tokio::test]
    async fn test_exactly_n_allowed_then_denied() {
        let (limiter, _, _) = limiter();

        for i in 0..5 {
            let decision = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
            assert!(decision.allowed, "request {} should pass", i + 1);
            assert_eq!(decision.remaining, 4 - i);
            assert_eq!(decision.outcome, DecisionOutcome::Allowed);
        }

        let sixth = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.retry_after, Some(60));
        assert_eq!(sixth.block_level, Some(0));
        assert!(sixth.escalated);
        assert_eq!(sixth.outcome, DecisionOutcome::Denied);
    }

    #[tokio::test]
    async fn test_block_counts_down_then_clean_window() {
        let (limiter, clock, store) = limiter();
        for _ in 0..6 {
            limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        }
        assert_eq!(store.ttl_seconds(&block_key(LimitType::LoginAttempts, IP)), Some(120));

        let mut last = u64::MAX;
        for _ in 0..5 {
            clock.advance_secs(10);
            let decision = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
            assert!(!decision.allowed);
            assert_eq!(decision.outcome, DecisionOutcome::Blocked);
            let retry = decision.retry_after.unwrap();
            assert!(retry < last, "retry_after must shrink as time passes");
            last = retry;
        }

        clock.advance_secs(11);
        let fresh = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4, "window starts clean after the block");
    }

    #[tokio::test]
    async fn test_escalation_increases_then_plateaus() {
        let (limiter, clock, store) = limiter();
        let ladder = [60u64, 300, 3600, 86_400];
        let mut levels = Vec::new();

        for round in 0..6 {
            let mut decision = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
            while decision.allowed {
                decision = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
            }
            assert!(decision.escalated, "round {} should escalate", round);
            let level = decision.block_level.unwrap();
            assert_eq!(decision.retry_after, Some(ladder[level as usize]));
            levels.push(level);

            clock.advance_secs(decision.retry_after.unwrap() as i64 + 1);
            // Keep escalation memory inside its 24h TTL for the test
            if decision.retry_after == Some(86_400) {
                let esc = escalation_key(LimitType::LoginAttempts, IP);
                let raw = serde_json::to_string(&EscalationState { level, last_escalation: 0 }).unwrap();
                store.set_value(&esc, &raw, Some(ESCALATION_TTL_SECONDS)).await.unwrap();
            }
        }

        assert_eq!(levels, vec![0, 1, 2, 3, 3, 3]);
    }

    #[tokio::test]
    async fn test_escalation_expires_after_ttl() {
        let (limiter, clock, _) = limiter();
        for _ in 0..6 {
            limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        }
        clock.advance_secs(ESCALATION_TTL_SECONDS as i64 + 1);

        for _ in 0..5 {
            assert!(limiter.check_rate_limit(LimitType::LoginAttempts, IP).await.allowed);
        }
        let denied = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        assert_eq!(denied.block_level, Some(0));
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_history() {
        let (limiter, _, store) = limiter();
        for _ in 0..6 {
            limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        }
        limiter.add_to_whitelist(LimitType::LoginAttempts, IP, None).await.unwrap();
        assert!(limiter.is_whitelisted(LimitType::LoginAttempts, IP).await.unwrap());

        for _ in 0..50 {
            let decision = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
            assert!(decision.allowed);
            assert_eq!(decision.outcome, DecisionOutcome::Whitelisted);
        }
        assert!(!store.contains_key(&window_key(LimitType::LoginAttempts, IP)));

        limiter.remove_from_whitelist(LimitType::LoginAttempts, IP).await.unwrap();
        assert!(!limiter.check_rate_limit(LimitType::LoginAttempts, IP).await.allowed);
    }

    #[tokio::test]
    async fn test_non_blocking_type_denies_until_window_slides() {
        let (limiter, clock, store) = limiter();
        for _ in 0..100 {
            assert!(limiter.check_rate_limit(LimitType::ApiCalls, IP).await.allowed);
        }
        let denied = limiter.check_rate_limit(LimitType::ApiCalls, IP).await;
        assert!(!denied.allowed);
        assert_eq!(denied.block_level, None);
        assert_eq!(denied.retry_after, Some(60));
        assert!(!store.contains_key(&block_key(LimitType::ApiCalls, IP)));

        clock.advance_secs(61);
        assert!(limiter.check_rate_limit(LimitType::ApiCalls, IP).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_all_state() {
        let (limiter, _, store) = limiter();
        for _ in 0..6 {
            limiter.check_rate_limit(LimitType::MfaAttempts, IP).await;
        }
        for _ in 0..5 {
            limiter.check_rate_limit(LimitType::MfaAttempts, IP).await;
        }
        assert!(store.contains_key(&block_key(LimitType::MfaAttempts, IP)));

        limiter.reset(LimitType::MfaAttempts, IP).await.unwrap();
        let status = limiter.status(LimitType::MfaAttempts, IP).await.unwrap();
        assert!(status.block.is_none());
        assert!(status.escalation.is_none());
        assert!(limiter.check_rate_limit(LimitType::MfaAttempts, IP).await.allowed);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), RateLimitConfig::default(), clock);

        let decision = limiter.check_rate_limit(LimitType::LoginAttempts, IP).await;
        assert!(decision.allowed);
        assert!(decision.is_degraded());
        assert_eq!(decision.limit, 0);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_block_ip_covers_ip_keyed_types() {
        let (limiter, _, _) = limiter();
        let ip: IpAddr = IP.parse().unwrap();
        limiter.block_ip(ip, 3600, "brute_force_attack").await.unwrap();

        for limit_type in [LimitType::LoginAttempts, LimitType::ApiCalls, LimitType::MfaAttempts] {
            let decision = limiter.check_rate_limit(limit_type, IP).await;
            assert!(!decision.allowed, "{} should be blocked", limit_type);
            assert_eq!(decision.retry_after, Some(3600));
        }
        assert!(limiter.check_rate_limit(LimitType::SessionCreation, IP).await.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_requests_never_overadmit() {
        let (limiter, _, _) = limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_rate_limit(LimitType::LoginAttempts, IP).await.allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
