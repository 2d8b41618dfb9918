use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

/// Escalation state outlives individual blocks by this long.
pub const ESCALATION_TTL_SECONDS: u64 = 86_400;

/// Categories of counted actions, each with its own policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    LoginAttempts,
    ApiCalls,
    SessionCreation,
    MfaAttempts,
}

impl LimitType {
    pub const ALL: [LimitType; 4] = [
        LimitType::LoginAttempts,
        LimitType::ApiCalls,
        LimitType::SessionCreation,
        LimitType::MfaAttempts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::LoginAttempts => "login_attempts",
            LimitType::ApiCalls => "api_calls",
            LimitType::SessionCreation => "session_creation",
            LimitType::MfaAttempts => "mfa_attempts",
        }
    }

    /// Suffix used by `RATE_LIMIT_<TYPE>` configuration variables
    pub fn env_suffix(&self) -> &'static str {
        match self {
            LimitType::LoginAttempts => "LOGIN_ATTEMPTS",
            LimitType::ApiCalls => "API_CALLS",
            LimitType::SessionCreation => "SESSION_CREATION",
            LimitType::MfaAttempts => "MFA_ATTEMPTS",
        }
    }

    pub fn from_env_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.env_suffix() == suffix)
    }

    /// Limit types whose identifier is a client IP
    pub fn is_ip_keyed(&self) -> bool {
        !matches!(self, LimitType::SessionCreation)
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AppError::InvalidLimitType(s.to_string()))
    }
}

/// Window, quota and block ladder for one limit type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_seconds: u64,
    /// Block durations in seconds, indexed by escalation level. Empty means
    /// violations are denied without blocking.
    pub block_durations: Vec<u64>,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window_seconds: u64, block_durations: Vec<u64>) -> Self {
        Self { max_requests, window_seconds, block_durations }
    }

    pub fn is_block_capable(&self) -> bool {
        !self.block_durations.is_empty()
    }

    /// Block duration for an escalation level, plateauing at the longest step.
    pub fn block_duration(&self, level: u32) -> Option<u64> {
        let last = self.block_durations.len().checked_sub(1)?;
        self.block_durations.get((level as usize).min(last)).copied()
    }

    pub fn max_level(&self) -> u32 {
        self.block_durations.len().saturating_sub(1) as u32
    }

    /// Parse `<max>/<window_secs>[/<d0>,<d1>,...]`
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut parts = raw.trim().split('/');

        let max_requests = parts
            .next()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| AppError::config(format!("invalid max requests in '{}'", raw)))?;

        let window_seconds = parts
            .next()
            .and_then(|p| p.trim().parse::<u64>().ok())
            .filter(|&w| w > 0)
            .ok_or_else(|| AppError::config(format!("invalid window in '{}'", raw)))?;

        let block_durations = match parts.next() {
            None => Vec::new(),
            Some(ladder) => ladder
                .split(',')
                .map(|d| d.trim().parse::<u64>().ok().filter(|&d| d > 0))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| AppError::config(format!("invalid block ladder in '{}'", raw)))?,
        };

        if parts.next().is_some() {
            return Err(AppError::config(format!("too many segments in '{}'", raw)));
        }

        Ok(Self::new(max_requests, window_seconds, block_durations))
    }
}

/// Policies for every limit type
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: RateLimitPolicy,
    pub api_calls: RateLimitPolicy,
    pub session_creation: RateLimitPolicy,
    pub mfa_attempts: RateLimitPolicy,
    /// Extra TTL kept on window and block keys
    pub slack_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_attempts: RateLimitPolicy::new(5, 900, vec![60, 300, 3600, 86_400]),
            api_calls: RateLimitPolicy::new(100, 60, vec![]),
            session_creation: RateLimitPolicy::new(3, 300, vec![1800]),
            mfa_attempts: RateLimitPolicy::new(10, 300, vec![900]),
            slack_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self, limit_type: LimitType) -> &RateLimitPolicy {
        match limit_type {
            LimitType::LoginAttempts => &self.login_attempts,
            LimitType::ApiCalls => &self.api_calls,
            LimitType::SessionCreation => &self.session_creation,
            LimitType::MfaAttempts => &self.mfa_attempts,
        }
    }

    pub fn policy_mut(&mut self, limit_type: LimitType) -> &mut RateLimitPolicy {
        match limit_type {
            LimitType::LoginAttempts => &mut self.login_attempts,
            LimitType::ApiCalls => &mut self.api_calls,
            LimitType::SessionCreation => &mut self.session_creation,
            LimitType::MfaAttempts => &mut self.mfa_attempts,
        }
    }
}

/// Active block, stored as JSON under `rate_limit:{type}:{id}:block`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub level: u32,
    /// Unix milliseconds
    pub block_time: i64,
    /// Unix milliseconds
    pub unblock_time: i64,
    pub identifier: String,
    #[serde(rename = "type")]
    pub limit_type: LimitType,
    #[serde(default)]
    pub reason: String,
}

impl BlockState {
    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms < self.unblock_time
    }

    /// Whole seconds until the block lifts, rounded up
    pub fn retry_after(&self, now_ms: i64) -> u64 {
        ceil_secs(self.unblock_time - now_ms)
    }
}

/// Repeat-offence memory, stored under `rate_limit:{type}:{id}:escalation`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationState {
    pub level: u32,
    /// Unix milliseconds
    pub last_escalation: i64,
}

/// Result of the atomic purge/insert/count batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u64,
    /// Score of the oldest entry still inside the window, in unix milliseconds
    pub oldest_ms: Option<i64>,
}

/// How a decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Within quota
    Allowed,
    /// Identifier is on the bypass list
    Whitelisted,
    /// Quota exceeded by this request
    Denied,
    /// An earlier violation is still being served
    Blocked,
    /// Store unreachable, allowed by default
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the caller's quota or block resets
    pub reset_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_level: Option<u32>,
    pub escalated: bool,
    pub outcome: DecisionOutcome,
}

impl RateLimitDecision {
    pub fn degraded(now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_time: ceil_secs(now_ms.max(0)),
            retry_after: None,
            block_level: None,
            escalated: false,
            outcome: DecisionOutcome::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome == DecisionOutcome::Degraded
    }
}

/// Support-tooling view of a key
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub limit_type: LimitType,
    pub identifier: String,
    pub whitelisted: bool,
    pub block: Option<BlockState>,
    pub escalation: Option<EscalationState>,
}

pub fn window_key(limit_type: LimitType, identifier: &str) -> String {
    format!("rate_limit:{}:{}", limit_type, identifier)
}

pub fn block_key(limit_type: LimitType, identifier: &str) -> String {
    format!("rate_limit:{}:{}:block", limit_type, identifier)
}

pub fn escalation_key(limit_type: LimitType, identifier: &str) -> String {
    format!("rate_limit:{}:{}:escalation", limit_type, identifier)
}

pub fn whitelist_key(limit_type: LimitType, identifier: &str) -> String {
    format!("whitelist:{}:{}", limit_type, identifier)
}

/// Milliseconds to whole seconds, rounding up
pub fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        0
    } else {
        ((ms + 999) / 1000) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema() {
        let t = LimitType::LoginAttempts;
        assert_eq!(window_key(t, "203.0.113.1"), "rate_limit:login_attempts:203.0.113.1");
        assert_eq!(block_key(t, "203.0.113.1"), "rate_limit:login_attempts:203.0.113.1:block");
        assert_eq!(escalation_key(t, "u1"), "rate_limit:login_attempts:u1:escalation");
        assert_eq!(whitelist_key(LimitType::ApiCalls, "10.0.0.1"), "whitelist:api_calls:10.0.0.1");
    }

    #[test]
    fn test_block_state_wire_format() {
        let block = BlockState {
            level: 2,
            block_time: 1_000,
            unblock_time: 3_601_000,
            identifier: "203.0.113.1".to_string(),
            limit_type: LimitType::LoginAttempts,
            reason: "rate_limit_exceeded".to_string(),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["level"], 2);
        assert_eq!(value["blockTime"], 1_000);
        assert_eq!(value["unblockTime"], 3_601_000);
        assert_eq!(value["type"], "login_attempts");
        assert_eq!(value["identifier"], "203.0.113.1");
    }

    #[test]
    fn test_block_duration_plateaus() {
        let policy = RateLimitConfig::default().login_attempts;
        assert_eq!(policy.block_duration(0), Some(60));
        assert_eq!(policy.block_duration(3), Some(86_400));
        assert_eq!(policy.block_duration(9), Some(86_400));
        assert_eq!(RateLimitConfig::default().api_calls.block_duration(0), None);
    }

    #[test]
    fn test_policy_parse() {
        let policy = RateLimitPolicy::parse("5/900/60,300,3600").unwrap();
        assert_eq!(policy, RateLimitPolicy::new(5, 900, vec![60, 300, 3600]));
        assert_eq!(RateLimitPolicy::parse("100/60").unwrap().block_durations, Vec::<u64>::new());
        assert!(RateLimitPolicy::parse("0/60").is_err());
        assert!(RateLimitPolicy::parse("5/abc").is_err());
        assert!(RateLimitPolicy::parse("5/60/1,,2").is_err());
        assert!(RateLimitPolicy::parse("5/60/1/2").is_err());
    }

    #[test]
    fn test_limit_type_parse() {
        assert_eq!("mfa_attempts".parse::<LimitType>().unwrap(), LimitType::MfaAttempts);
        assert!(matches!("password_resets".parse::<LimitType>(), Err(AppError::InvalidLimitType(_))));
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(0), 0);
        assert_eq!(ceil_secs(1), 1);
        assert_eq!(ceil_secs(1000), 1);
        assert_eq!(ceil_secs(1001), 2);
    }
}
