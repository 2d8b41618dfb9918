use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Kinds of threat the monitor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    BruteForceAttack,
    /// Covers network and device anomalies, with the differing signals in the evidence
    SessionHijack,
    SuspiciousUserAgent,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::BruteForceAttack => "brute_force_attack",
            ThreatType::SessionHijack => "session_hijack",
            ThreatType::SuspiciousUserAgent => "suspicious_user_agent",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for ThreatSeverity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(ThreatSeverity::Low),
            "medium" => Ok(ThreatSeverity::Medium),
            "high" => Ok(ThreatSeverity::High),
            "critical" => Ok(ThreatSeverity::Critical),
            other => Err(format!("expected low, medium, high or critical, got '{}'", other)),
        }
    }
}

/// Response applied to a threat. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mitigation {
    LogOnly,
    Alert,
    BlockIp,
    TerminateSession,
}

impl Mitigation {
    pub const fn for_severity(severity: ThreatSeverity) -> Self {
        match severity {
            ThreatSeverity::Low => Mitigation::LogOnly,
            ThreatSeverity::Medium => Mitigation::Alert,
            ThreatSeverity::High => Mitigation::BlockIp,
            ThreatSeverity::Critical => Mitigation::TerminateSession,
        }
    }
}

/// Append-only record of a detected threat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatEvent {
    pub id: String,
    pub threat_type: ThreatType,
    pub severity: ThreatSeverity,
    pub description: String,
    pub evidence: Map<String, Value>,
    pub user_id: Option<String>,
    pub clinic_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: IpAddr,
    pub timestamp: DateTime<Utc>,
}

impl ThreatEvent {
    pub fn new(
        threat_type: ThreatType,
        severity: ThreatSeverity,
        description: impl Into<String>,
        ip_address: IpAddr,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            threat_type,
            severity,
            description: description.into(),
            evidence: Map::new(),
            user_id: None,
            clinic_id: None,
            session_id: None,
            ip_address,
            timestamp,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>, clinic_id: Option<String>) -> Self {
        self.user_id = user_id;
        self.clinic_id = clinic_id;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }
}

/// A login attempt as reported by the identity provider
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub ip_address: IpAddr,
    pub user_id: Option<String>,
    pub clinic_id: Option<String>,
    pub user_agent: String,
    pub success: bool,
    pub fingerprint: Option<String>,
}

/// What the current request looks like, compared against the session
#[derive(Debug, Clone)]
pub struct ObservedActivity {
    pub ip_address: IpAddr,
    pub user_agent: String,
    pub fingerprint: Option<String>,
}

/// Per-user record of a device, keyed by the hash of its fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFingerprint {
    pub fingerprint_hash: String,
    pub is_trusted: bool,
    pub trust_score: f64,
    pub last_used: DateTime<Utc>,
}

/// Signal weights for the hijack score
#[derive(Debug, Clone)]
pub struct HijackWeights {
    pub ip: u32,
    pub user_agent: u32,
    pub device: u32,
    /// Only applied alongside at least one mismatch
    pub automation: u32,
}

impl Default for HijackWeights {
    fn default() -> Self {
        Self { ip: 1, user_agent: 1, device: 1, automation: 2 }
    }
}

/// Anomaly thresholds and responses
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub brute_force_threshold: u64,
    pub brute_force_window_seconds: u64,
    pub hijack_weights: HijackWeights,
    pub hijack_medium_score: u32,
    pub hijack_high_score: u32,
    pub hijack_critical_score: u32,
    pub ip_block_seconds: u64,
    pub device_trust_increment: f64,
    pub device_trust_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            brute_force_threshold: 5,
            brute_force_window_seconds: 900,
            hijack_weights: HijackWeights::default(),
            hijack_medium_score: 1,
            hijack_high_score: 2,
            hijack_critical_score: 5,
            ip_block_seconds: 3600,
            device_trust_increment: 0.25,
            device_trust_threshold: 1.0,
        }
    }
}

impl MonitorConfig {
    pub fn hijack_severity(&self, score: u32) -> Option<ThreatSeverity> {
        if score >= self.hijack_critical_score {
            Some(ThreatSeverity::Critical)
        } else if score >= self.hijack_high_score {
            Some(ThreatSeverity::High)
        } else if score >= self.hijack_medium_score && score > 0 {
            Some(ThreatSeverity::Medium)
        } else {
            None
        }
    }
}
