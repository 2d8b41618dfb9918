use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    auth::{
        audit::AuditManager,
        ses::SessionManager,
        utils::{is_automation_user_agent, sanitize_for_logging, sha256_hash},
    },
    clock::{Clock, SharedClock},
    database::CounterStore,
    errors::Result,
    middleware::rate::RateLimiter,
    models::{
        security::{
            DeviceFingerprint, LoginAttempt, Mitigation, MonitorConfig, ObservedActivity, ThreatEvent,
            ThreatSeverity, ThreatType,
        },
        ses::Session,
    },
};

fn failure_key(dimension: &str, identifier: &str) -> String {
    format!("login_failures:{}:{}", dimension, identifier)
}

/// Brute-force, session-hijack and device-trust heuristics plus the response policy
pub struct SecurityMonitor {
    counters: Arc<dyn CounterStore>,
    session_manager: Arc<SessionManager>,
    rate_limiter: Arc<RateLimiter>,
    audit_manager: Arc<AuditManager>,
    config: MonitorConfig,
    clock: SharedClock,
}

impl SecurityMonitor {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        session_manager: Arc<SessionManager>,
        rate_limiter: Arc<RateLimiter>,
        audit_manager: Arc<AuditManager>,
        config: MonitorConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            counters,
            session_manager,
            rate_limiter,
            audit_manager,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    async fn count_failure(&self, dimension: &str, identifier: &str) -> Result<u64> {
        let window = self.config.brute_force_window_seconds;
        let snapshot = self
            .counters
            .record_hit(
                &failure_key(dimension, identifier),
                self.clock.now_millis(),
                (window as i64) * 1000,
                window + 60,
            )
            .await?;
        Ok(snapshot.count)
    }

    /// Inspect a login attempt. Failures are counted per IP and per user over the
    /// brute-force window.
    pub async fn analyze_login_attempt(&self, attempt: &LoginAttempt) -> Result<Vec<ThreatEvent>> {
        let mut threats = Vec::new();
        if attempt.success {
            return Ok(threats);
        }

        let now = self.clock.now();
        let ip_failures = self.count_failure("ip", &attempt.ip_address.to_string()).await?;
        let user_failures = match &attempt.user_id {
            Some(user_id) => Some(self.count_failure("user", user_id).await?),
            None => None,
        };

        let threshold = self.config.brute_force_threshold;
        if ip_failures >= threshold || user_failures.is_some_and(|n| n >= threshold) {
            threats.push(
                ThreatEvent::new(
                    ThreatType::BruteForceAttack,
                    ThreatSeverity::High,
                    format!(
                        "Repeated failed logins within {}s",
                        self.config.brute_force_window_seconds
                    ),
                    attempt.ip_address,
                    now,
                )
                .with_user(attempt.user_id.clone(), attempt.clinic_id.clone())
                .with_evidence("ipFailures", ip_failures)
                .with_evidence("userFailures", user_failures)
                .with_evidence("threshold", threshold)
                .with_evidence("windowSeconds", self.config.brute_force_window_seconds),
            );
        }

        if is_automation_user_agent(&attempt.user_agent) {
            threats.push(
                ThreatEvent::new(
                    ThreatType::SuspiciousUserAgent,
                    ThreatSeverity::Low,
                    "Failed login from automation user agent",
                    attempt.ip_address,
                    now,
                )
                .with_user(attempt.user_id.clone(), attempt.clinic_id.clone())
                .with_evidence("userAgent", sanitize_for_logging(&attempt.user_agent)),
            );
        }

        Ok(threats)
    }

    /// Compare the current request against what the session was issued with.
    ///
    /// All differing signals go into one `session_hijack` event; severity follows
    /// the summed signal weights. Device use is recorded for trust accumulation.
    pub async fn analyze_session_activity(
        &self,
        session: &Session,
        observed: &ObservedActivity,
    ) -> Result<Vec<ThreatEvent>> {
        let weights = &self.config.hijack_weights;
        let issued = &session.device_info;
        let mut score = 0;
        let mut signals = Vec::new();

        if observed.ip_address != issued.ip_address {
            score += weights.ip;
            signals.push("ip_address");
        }
        if observed.user_agent != issued.user_agent {
            score += weights.user_agent;
            signals.push("user_agent");
        }
        if let (Some(expected), Some(seen)) = (&issued.fingerprint, &observed.fingerprint) {
            if expected != seen {
                score += weights.device;
                signals.push("device_fingerprint");
            }
        }
        let automation = is_automation_user_agent(&observed.user_agent);
        if automation && !signals.is_empty() {
            score += weights.automation;
        }

        let mut threats = Vec::new();
        if let Some(severity) = self.config.hijack_severity(score) {
            threats.push(
                ThreatEvent::new(
                    ThreatType::SessionHijack,
                    severity,
                    format!("Session used with changed {}", signals.join(", ")),
                    observed.ip_address,
                    self.clock.now(),
                )
                .with_user(Some(session.user_id.clone()), Some(session.clinic_id.clone()))
                .with_session(session.id.clone())
                .with_evidence("signals", signals.clone())
                .with_evidence("score", score)
                .with_evidence("expectedIp", issued.ip_address.to_string())
                .with_evidence("observedIp", observed.ip_address.to_string())
                .with_evidence("observedUserAgent", sanitize_for_logging(&observed.user_agent))
                .with_evidence("automationSignature", automation),
            );
        }

        if let Some(fingerprint) = &observed.fingerprint {
            self.record_device_use(&session.user_id, fingerprint, !threats.is_empty())
                .await?;
        }

        Ok(threats)
    }

    /// True only for an exact fingerprint match that has earned trust
    pub async fn is_device_trusted(&self, user_id: &str, fingerprint: &str) -> Result<bool> {
        let fingerprint_hash = sha256_hash(fingerprint);
        Ok(self
            .session_manager
            .get_device(user_id, &fingerprint_hash)
            .await?
            .is_some_and(|device| device.fingerprint_hash == fingerprint_hash && device.is_trusted))
    }

    /// First sight creates an untrusted record. Clean uses add trust; an anomalous
    /// use resets it.
    pub async fn record_device_use(
        &self,
        user_id: &str,
        fingerprint: &str,
        anomalous: bool,
    ) -> Result<DeviceFingerprint> {
        let fingerprint_hash = sha256_hash(fingerprint);
        let now = self.clock.now();

        let device = match self.session_manager.get_device(user_id, &fingerprint_hash).await? {
            None => DeviceFingerprint {
                fingerprint_hash,
                is_trusted: false,
                trust_score: 0.0,
                last_used: now,
            },
            Some(mut device) => {
                if anomalous {
                    device.trust_score = 0.0;
                    device.is_trusted = false;
                } else {
                    let threshold = self.config.device_trust_threshold;
                    device.trust_score = (device.trust_score + self.config.device_trust_increment).min(threshold);
                    device.is_trusted = device.trust_score >= threshold;
                }
                device.last_used = now;
                device
            }
        };

        self.session_manager.save_device(user_id, &device).await?;
        Ok(device)
    }

    /// Apply the severity's mitigation and record the threat
    pub async fn handle_security_threat(&self, threat: &ThreatEvent) -> Result<Mitigation> {
        let mitigation = Mitigation::for_severity(threat.severity);

        if let Err(e) = self.audit_manager.record(threat, mitigation).await {
            warn!("Failed to record threat {}: {}", threat.id, e);
        }

        match mitigation {
            Mitigation::LogOnly => {
                info!(
                    threat_type = %threat.threat_type,
                    ip = %threat.ip_address,
                    "Security event: {}",
                    threat.description
                );
            }
            Mitigation::Alert => {
                warn!(
                    threat_type = %threat.threat_type,
                    ip = %threat.ip_address,
                    user_id = ?threat.user_id,
                    "SECURITY ALERT: {}",
                    threat.description
                );
            }
            Mitigation::BlockIp => {
                warn!(
                    threat_type = %threat.threat_type,
                    ip = %threat.ip_address,
                    block_seconds = self.config.ip_block_seconds,
                    "Blocking IP: {}",
                    threat.description
                );
                self.block_ip(threat.ip_address, threat.threat_type).await?;
            }
            Mitigation::TerminateSession => {
                error!(
                    threat_type = %threat.threat_type,
                    ip = %threat.ip_address,
                    session_id = ?threat.session_id,
                    "Terminating session: {}",
                    threat.description
                );
                self.terminate(threat).await?;
            }
        }

        Ok(mitigation)
    }

    async fn block_ip(&self, ip: IpAddr, threat_type: ThreatType) -> Result<()> {
        self.rate_limiter
            .block_ip(ip, self.config.ip_block_seconds, threat_type.as_str())
            .await
    }

    async fn terminate(&self, threat: &ThreatEvent) -> Result<()> {
        let reason = format!("security_threat:{}", threat.threat_type);
        match (&threat.session_id, &threat.user_id) {
            (Some(session_id), _) => {
                self.session_manager.revoke_session(session_id, &reason).await?;
            }
            (None, Some(user_id)) => {
                self.session_manager.revoke_user_sessions(user_id, &reason).await?;
            }
            (None, None) => {
                warn!(threat_id = %threat.id, "Critical threat without a session or user to terminate");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        database::{MemoryStore, UnavailableStore},
        models::{
            rate::{LimitType, RateLimitConfig},
            ses::{DeviceInfo, Role, SessionConfig},
        },
    };

    const BROWSER: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/126.0";

    struct Harness {
        monitor: SecurityMonitor,
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditManager>,
        clock: Arc<ManualClock>,
    }

    fn build(clock: Arc<ManualClock>, counters: Arc<dyn CounterStore>) -> Harness {
        let limiter_store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(limiter_store, RateLimitConfig::default(), clock.clone()));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryStore::new(clock.clone())),
            limiter.clone(),
            SessionConfig::default(),
            clock.clone(),
        ));
        let audit = Arc::new(AuditManager::new());
        let monitor = SecurityMonitor::new(
            counters,
            sessions.clone(),
            limiter.clone(),
            audit.clone(),
            MonitorConfig::default(),
            clock.clone(),
        );
        Harness { monitor, sessions, limiter, audit, clock }
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::at_epoch_plus(1_700_000_000));
        build(clock.clone(), Arc::new(MemoryStore::new(clock)))
    }

    fn failed_login(ip: &str, user: Option<&str>) -> LoginAttempt {
        LoginAttempt {
            ip_address: ip.parse().unwrap(),
            user_id: user.map(str::to_string),
            clinic_id: Some("c1".to_string()),
            user_agent: BROWSER.to_string(),
            success: false,
            fingerprint: None,
        }
    }

    async fn session(h: &Harness, fingerprint: Option<&str>) -> Session {
        let device = DeviceInfo {
            ip_address: "192.168.1.100".parse().unwrap(),
            user_agent: BROWSER.to_string(),
            fingerprint: fingerprint.map(str::to_string),
        };
        h.sessions.create_session("u1", "c1", Role::Staff, device).await.unwrap().session
    }

    #[tokio::test]
    async fn test_brute_force_on_fifth_failure() {
        let h = harness();
        for attempt in 1..=4 {
            let threats = h.monitor.analyze_login_attempt(&failed_login("203.0.113.1", None)).await.unwrap();
            assert!(threats.is_empty(), "attempt {} should not trigger", attempt);
        }

        let threats = h.monitor.analyze_login_attempt(&failed_login("203.0.113.1", None)).await.unwrap();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].threat_type, ThreatType::BruteForceAttack);
        assert_eq!(threats[0].severity, ThreatSeverity::High);
        assert_eq!(threats[0].evidence["ipFailures"], 5);
    }

    #[tokio::test]
    async fn test_brute_force_by_user_across_ips() {
        let h = harness();
        let ips = ["198.51.100.1", "198.51.100.2", "198.51.100.3", "198.51.100.4", "198.51.100.5"];
        let mut last = Vec::new();
        for ip in ips {
            last = h.monitor.analyze_login_attempt(&failed_login(ip, Some("u1"))).await.unwrap();
        }
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].evidence["userFailures"], 5);
        assert_eq!(last[0].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_failures_age_out_of_window() {
        let h = harness();
        for _ in 0..4 {
            h.monitor.analyze_login_attempt(&failed_login("203.0.113.1", None)).await.unwrap();
        }
        h.clock.advance_secs(901);
        let threats = h.monitor.analyze_login_attempt(&failed_login("203.0.113.1", None)).await.unwrap();
        assert!(threats.is_empty());
    }

    #[tokio::test]
    async fn test_successful_login_and_automation_agent() {
        let h = harness();
        let mut success = failed_login("203.0.113.1", Some("u1"));
        success.success = true;
        assert!(h.monitor.analyze_login_attempt(&success).await.unwrap().is_empty());

        let mut scripted = failed_login("203.0.113.9", None);
        scripted.user_agent = "python-requests/2.31".to_string();
        let threats = h.monitor.analyze_login_attempt(&scripted).await.unwrap();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].threat_type, ThreatType::SuspiciousUserAgent);
        assert_eq!(threats[0].severity, ThreatSeverity::Low);
    }

    #[tokio::test]
    async fn test_hijack_with_both_signals_is_high() {
        let h = harness();
        let session = session(&h, None).await;
        let observed = ObservedActivity {
            ip_address: "203.0.113.50".parse().unwrap(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/127.0".to_string(),
            fingerprint: None,
        };

        let threats = h.monitor.analyze_session_activity(&session, &observed).await.unwrap();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].threat_type, ThreatType::SessionHijack);
        assert_eq!(threats[0].severity, ThreatSeverity::High);
        assert_eq!(threats[0].session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(threats[0].evidence["signals"], serde_json::json!(["ip_address", "user_agent"]));
    }

    #[tokio::test]
    async fn test_hijack_severity_scales_with_signals() {
        let h = harness();
        let session = session(&h, Some("fp-1")).await;

        let unchanged = ObservedActivity {
            ip_address: session.device_info.ip_address,
            user_agent: BROWSER.to_string(),
            fingerprint: Some("fp-1".to_string()),
        };
        assert!(h.monitor.analyze_session_activity(&session, &unchanged).await.unwrap().is_empty());

        let new_ip = ObservedActivity { ip_address: "203.0.113.50".parse().unwrap(), ..unchanged.clone() };
        let threats = h.monitor.analyze_session_activity(&session, &new_ip).await.unwrap();
        assert_eq!(threats[0].severity, ThreatSeverity::Medium);

        let scripted = ObservedActivity { user_agent: "curl/8.4.0".to_string(), ..new_ip.clone() };
        let threats = h.monitor.analyze_session_activity(&session, &scripted).await.unwrap();
        assert_eq!(threats[0].severity, ThreatSeverity::High);

        let everything = ObservedActivity { fingerprint: Some("fp-2".to_string()), ..scripted };
        let threats = h.monitor.analyze_session_activity(&session, &everything).await.unwrap();
        assert_eq!(threats[0].severity, ThreatSeverity::Critical);
    }

    #[tokio::test]
    async fn test_device_trust_is_exact_and_earned() {
        let h = harness();
        assert!(!h.monitor.is_device_trusted("u1", "fp-abc").await.unwrap());

        let first = h.monitor.record_device_use("u1", "fp-abc", false).await.unwrap();
        assert!(!first.is_trusted);
        assert_eq!(first.trust_score, 0.0);

        for _ in 0..3 {
            h.monitor.record_device_use("u1", "fp-abc", false).await.unwrap();
        }
        assert!(!h.monitor.is_device_trusted("u1", "fp-abc").await.unwrap());
        h.monitor.record_device_use("u1", "fp-abc", false).await.unwrap();
        assert!(h.monitor.is_device_trusted("u1", "fp-abc").await.unwrap());

        assert!(!h.monitor.is_device_trusted("u1", "fp-abd").await.unwrap());
        assert!(!h.monitor.is_device_trusted("u2", "fp-abc").await.unwrap());

        h.monitor.record_device_use("u1", "fp-abc", true).await.unwrap();
        assert!(!h.monitor.is_device_trusted("u1", "fp-abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_high_threat_blocks_ip() {
        let h = harness();
        let brute = ThreatEvent::new(
            ThreatType::BruteForceAttack,
            ThreatSeverity::High,
            "test",
            "203.0.113.1".parse().unwrap(),
            h.clock.now(),
        );
        let mitigation = h.monitor.handle_security_threat(&brute).await.unwrap();
        assert_eq!(mitigation, Mitigation::BlockIp);

        let decision = h.limiter.check_rate_limit(LimitType::ApiCalls, "203.0.113.1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(3600));
        assert_eq!(h.audit.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_critical_threat_terminates_session() {
        let h = harness();
        let session = session(&h, None).await;
        let threat = ThreatEvent::new(
            ThreatType::SessionHijack,
            ThreatSeverity::Critical,
            "test",
            "203.0.113.50".parse().unwrap(),
            h.clock.now(),
        )
        .with_session(session.id.clone());

        assert_eq!(h.monitor.handle_security_threat(&threat).await.unwrap(), Mitigation::TerminateSession);
        let stored = h.sessions.get_session(&session.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn test_low_and_medium_only_log() {
        let h = harness();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        for severity in [ThreatSeverity::Low, ThreatSeverity::Medium] {
            let threat = ThreatEvent::new(ThreatType::SessionHijack, severity, "test", ip, h.clock.now());
            h.monitor.handle_security_threat(&threat).await.unwrap();
        }
        assert!(h.limiter.check_rate_limit(LimitType::ApiCalls, &ip.to_string()).await.allowed);
        assert_eq!(h.audit.recent(10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_counter_outage_surfaces_error() {
        let h = build(Arc::new(ManualClock::at_epoch_plus(1_700_000_000)), Arc::new(UnavailableStore));
        let result = h.monitor.analyze_login_attempt(&failed_login("203.0.113.1", None)).await;
        assert!(result.is_err());
    }
}
