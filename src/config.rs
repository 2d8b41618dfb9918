use dotenvy::dotenv;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{
    auth::{audit::AuditConfig, utils::TrustedProxies},
    errors::{AppError, Result},
    middleware::gateway::GatewayConfig,
    models::{
        rate::{LimitType, RateLimitConfig, RateLimitPolicy},
        security::MonitorConfig,
        ses::SessionConfig,
    },
};

const RATE_LIMIT_PREFIX: &str = "RATE_LIMIT_";
const RATE_LIMIT_SLACK: &str = "RATE_LIMIT_SLACK_SECONDS";
const MIN_IDP_SECRET_BYTES: usize = 32;

/// Which implementation backs the counter and session stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// In-process, for local development only
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("expected 'redis' or 'memory', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub redis_url: String,
    pub session_redis_url: String,
    pub store_backend: StoreBackend,
    pub store_timeout: Duration,
    pub audit: AuditConfig,
    pub rate_limits: RateLimitConfig,
    pub sessions: SessionConfig,
    pub monitor: MonitorConfig,
    pub monitor_timeout: Duration,
    pub login_path: String,
    pub unauthorized_path: String,
    /// Peers allowed to set X-Forwarded-For / X-Real-IP
    pub trusted_proxies: TrustedProxies,
    /// Shared secret the identity provider signs its calls with. Unset disables those routes.
    pub idp_secret: Option<String>,
    pub idp_max_skew: Duration,
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn raw(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or(default).to_string()
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(name) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| AppError::config(format!("{} must be valid: {}", name, e))),
        }
    }
}

impl Config {
    /// Load from the process environment, after `.env` if present
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars = Vars(vars.into_iter().collect());

        let redis_url = vars.string("REDIS_URL", "redis://127.0.0.1:6379");
        let session_redis_url = vars.string("SESSION_REDIS_URL", &redis_url);

        let session_defaults = SessionConfig::default();
        let sessions = SessionConfig {
            idle_minutes_admin: vars.parse("SESSION_IDLE_MINUTES_ADMIN", session_defaults.idle_minutes_admin)?,
            idle_minutes_staff: vars.parse("SESSION_IDLE_MINUTES_STAFF", session_defaults.idle_minutes_staff)?,
            idle_minutes_viewer: vars.parse("SESSION_IDLE_MINUTES_VIEWER", session_defaults.idle_minutes_viewer)?,
            absolute_hours: vars.parse("SESSION_ABSOLUTE_HOURS", session_defaults.absolute_hours)?,
            max_concurrent_sessions: vars.parse("SESSION_MAX_CONCURRENT", session_defaults.max_concurrent_sessions)?,
            cookie_name: vars.string("SESSION_COOKIE_NAME", &session_defaults.cookie_name),
            cookie_secure: vars.parse("SESSION_COOKIE_SECURE", session_defaults.cookie_secure)?,
        };

        let monitor_defaults = MonitorConfig::default();
        let weight_defaults = monitor_defaults.hijack_weights.clone();
        let mut monitor = MonitorConfig {
            brute_force_threshold: vars.parse("BRUTE_FORCE_THRESHOLD", monitor_defaults.brute_force_threshold)?,
            brute_force_window_seconds: vars
                .parse("BRUTE_FORCE_WINDOW_SECONDS", monitor_defaults.brute_force_window_seconds)?,
            hijack_medium_score: vars.parse("HIJACK_MEDIUM_SCORE", monitor_defaults.hijack_medium_score)?,
            hijack_high_score: vars.parse("HIJACK_HIGH_SCORE", monitor_defaults.hijack_high_score)?,
            hijack_critical_score: vars.parse("HIJACK_CRITICAL_SCORE", monitor_defaults.hijack_critical_score)?,
            ip_block_seconds: vars.parse("IP_BLOCK_SECONDS", monitor_defaults.ip_block_seconds)?,
            device_trust_increment: vars.parse("DEVICE_TRUST_INCREMENT", monitor_defaults.device_trust_increment)?,
            device_trust_threshold: vars.parse("DEVICE_TRUST_THRESHOLD", monitor_defaults.device_trust_threshold)?,
            ..monitor_defaults
        };
        monitor.hijack_weights.ip = vars.parse("HIJACK_WEIGHT_IP", weight_defaults.ip)?;
        monitor.hijack_weights.user_agent = vars.parse("HIJACK_WEIGHT_USER_AGENT", weight_defaults.user_agent)?;
        monitor.hijack_weights.device = vars.parse("HIJACK_WEIGHT_DEVICE", weight_defaults.device)?;
        monitor.hijack_weights.automation = vars.parse("HIJACK_WEIGHT_AUTOMATION", weight_defaults.automation)?;

        let audit_defaults = AuditConfig::default();
        let audit = AuditConfig {
            enabled: vars.parse("AUDIT_ENABLED", audit_defaults.enabled)?,
            log_file_path: vars.raw("AUDIT_LOG_PATH").map(PathBuf::from),
            min_severity: vars.parse("AUDIT_MIN_SEVERITY", audit_defaults.min_severity)?,
            ..audit_defaults
        };

        let trusted_proxies = TrustedProxies::parse_list(vars.raw("TRUSTED_PROXIES").unwrap_or(""))
            .map_err(|e| AppError::config(format!("TRUSTED_PROXIES must be valid: {}", e)))?;

        let config = Self {
            host: vars.string("HOST", "127.0.0.1"),
            port: vars.parse("PORT", 8080)?,
            log_level: vars.string("LOG_LEVEL", "info"),
            redis_url,
            session_redis_url,
            store_backend: vars.parse("STORE_BACKEND", StoreBackend::Redis)?,
            store_timeout: Duration::from_millis(vars.parse("STORE_TIMEOUT_MS", 250)?),
            audit,
            rate_limits: rate_limits_from(&vars)?,
            sessions,
            monitor,
            monitor_timeout: Duration::from_millis(vars.parse("MONITOR_TIMEOUT_MS", 200)?),
            login_path: vars.string("LOGIN_PATH", "/login"),
            unauthorized_path: vars.string("UNAUTHORIZED_PATH", "/unauthorized"),
            trusted_proxies,
            idp_secret: vars.raw("IDP_SHARED_SECRET").map(str::to_string),
            idp_max_skew: Duration::from_secs(vars.parse("IDP_MAX_SKEW_SECONDS", 300)?),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let s = &self.sessions;
        let absolute_minutes = s.absolute_hours.saturating_mul(60);
        if s.absolute_hours <= 0 {
            return Err(AppError::config("SESSION_ABSOLUTE_HOURS must be positive"));
        }
        for (name, minutes) in [
            ("SESSION_IDLE_MINUTES_ADMIN", s.idle_minutes_admin),
            ("SESSION_IDLE_MINUTES_STAFF", s.idle_minutes_staff),
            ("SESSION_IDLE_MINUTES_VIEWER", s.idle_minutes_viewer),
        ] {
            if minutes <= 0 || minutes >= absolute_minutes {
                return Err(AppError::config(format!(
                    "{} must be positive and shorter than the absolute lifetime",
                    name
                )));
            }
        }
        if s.max_concurrent_sessions == 0 {
            return Err(AppError::config("SESSION_MAX_CONCURRENT must be at least 1"));
        }

        let m = &self.monitor;
        if m.brute_force_threshold == 0 || m.brute_force_window_seconds == 0 {
            return Err(AppError::config("brute force threshold and window must be positive"));
        }
        if !(m.hijack_medium_score <= m.hijack_high_score && m.hijack_high_score <= m.hijack_critical_score) {
            return Err(AppError::config("hijack scores must be ordered medium <= high <= critical"));
        }
        if m.device_trust_increment <= 0.0 || m.device_trust_threshold <= 0.0 {
            return Err(AppError::config("device trust increment and threshold must be positive"));
        }
        if !self.login_path.starts_with('/') || !self.unauthorized_path.starts_with('/') {
            return Err(AppError::config("LOGIN_PATH and UNAUTHORIZED_PATH must be absolute paths"));
        }
        if self.idp_secret.as_ref().is_some_and(|s| s.len() < MIN_IDP_SECRET_BYTES) {
            return Err(AppError::config(format!(
                "IDP_SHARED_SECRET must be at least {} bytes",
                MIN_IDP_SECRET_BYTES
            )));
        }
        Ok(())
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            login_path: self.login_path.clone(),
            unauthorized_path: self.unauthorized_path.clone(),
            cookie_name: self.sessions.cookie_name.clone(),
            cookie_secure: self.sessions.cookie_secure,
            monitor_timeout: self.monitor_timeout,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }

    // Smart RUST_LOG construction for Axum and tracing
    pub fn rust_log(&self) -> String {
        match self.log_level.to_lowercase().as_str() {
            "trace" => "trace,axum=trace,tower=trace,hyper=trace,wardgate=trace".to_string(),
            "debug" => "debug,axum=debug,tower=debug,hyper=debug,wardgate=debug".to_string(),
            "info" => "info,axum=info,tower=info,hyper=info,wardgate=info".to_string(),
            "warn" => "warn,axum=warn,tower=warn,hyper=warn,wardgate=warn".to_string(),
            "error" => "error,axum=error,tower=error,hyper=error,wardgate=error".to_string(),
            _ => "info,axum=info,tower=info,hyper=info,wardgate=info".to_string(), // fallback
        }
    }
}

/// `RATE_LIMIT_<TYPE>` overrides. An unknown type is fatal.
fn rate_limits_from(vars: &Vars) -> Result<RateLimitConfig> {
    let mut limits = RateLimitConfig {
        slack_seconds: vars.parse(RATE_LIMIT_SLACK, RateLimitConfig::default().slack_seconds)?,
        ..RateLimitConfig::default()
    };

    for (name, value) in &vars.0 {
        let Some(suffix) = name.strip_prefix(RATE_LIMIT_PREFIX) else {
            continue;
        };
        if name == RATE_LIMIT_SLACK {
            continue;
        }
        let limit_type = LimitType::from_env_suffix(suffix).ok_or_else(|| AppError::InvalidLimitType(name.clone()))?;
        *limits.policy_mut(limit_type) = RateLimitPolicy::parse(value)?;
    }

    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::security::ThreatSeverity;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(Vec::new()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.store_backend, StoreBackend::Redis);
        assert_eq!(config.session_redis_url, config.redis_url);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.rate_limits.login_attempts.block_durations, vec![60, 300, 3600, 86_400]);
        assert_eq!(config.sessions.max_concurrent_sessions, 3);
        assert_eq!(config.monitor.brute_force_threshold, 5);
        assert_eq!(config.gateway().cookie_name, "session_token");
        assert_eq!(config.rust_log(), "info,axum=info,tower=info,hyper=info,wardgate=info");
    }

    #[test]
    fn test_rate_limit_overrides() {
        let config = Config::from_vars(vars(&[
            ("RATE_LIMIT_API_CALLS", "250/30"),
            ("RATE_LIMIT_LOGIN_ATTEMPTS", "3/600/30,120"),
            ("RATE_LIMIT_SLACK_SECONDS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.rate_limits.api_calls, RateLimitPolicy::new(250, 30, vec![]));
        assert_eq!(config.rate_limits.login_attempts, RateLimitPolicy::new(3, 600, vec![30, 120]));
        assert_eq!(config.rate_limits.slack_seconds, 10);
    }

    #[test]
    fn test_unknown_limit_type_is_fatal() {
        let err = Config::from_vars(vars(&[("RATE_LIMIT_REQUESTS", "100/60")])).unwrap_err();
        assert!(matches!(err, AppError::InvalidLimitType(name) if name == "RATE_LIMIT_REQUESTS"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_vars(vars(&[("PORT", "eighty")])).is_err());
        assert!(Config::from_vars(vars(&[("RATE_LIMIT_MFA_ATTEMPTS", "0/300")])).is_err());
        assert!(Config::from_vars(vars(&[("STORE_BACKEND", "postgres")])).is_err());
        assert!(Config::from_vars(vars(&[("SESSION_IDLE_MINUTES_ADMIN", "720")])).is_err());
        assert!(Config::from_vars(vars(&[("HIJACK_HIGH_SCORE", "9")])).is_err());
    }

    #[test]
    fn test_session_and_monitor_overrides() {
        let config = Config::from_vars(vars(&[
            ("SESSION_IDLE_MINUTES_VIEWER", "5"),
            ("SESSION_COOKIE_SECURE", "false"),
            ("HIJACK_WEIGHT_AUTOMATION", "3"),
            ("STORE_BACKEND", "memory"),
            ("AUDIT_LOG_PATH", "/var/log/wardgate/audit.log"),
        ]))
        .unwrap();
        assert_eq!(config.sessions.idle_minutes_viewer, 5);
        assert!(!config.sessions.cookie_secure);
        assert_eq!(config.monitor.hijack_weights.automation, 3);
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.audit.log_file_path, Some(PathBuf::from("/var/log/wardgate/audit.log")));
    }

    #[test]
    fn test_audit_proxy_and_idp_settings() {
        let config = Config::from_vars(Vec::new()).unwrap();
        assert!(config.audit.enabled);
        assert_eq!(config.audit.min_severity, ThreatSeverity::Low);
        assert!(config.trusted_proxies.is_empty());
        assert_eq!(config.idp_secret, None);

        let config = Config::from_vars(vars(&[
            ("AUDIT_ENABLED", "false"),
            ("AUDIT_MIN_SEVERITY", "High"),
            ("TRUSTED_PROXIES", "10.0.0.0/8,192.168.1.10"),
            ("IDP_SHARED_SECRET", "0123456789abcdef0123456789abcdef"),
            ("IDP_MAX_SKEW_SECONDS", "60"),
        ]))
        .unwrap();
        assert!(!config.audit.enabled);
        assert_eq!(config.audit.min_severity, ThreatSeverity::High);
        assert!(config.gateway().trusted_proxies.contains(&"10.9.8.7".parse().unwrap()));
        assert_eq!(config.idp_max_skew, Duration::from_secs(60));

        assert!(Config::from_vars(vars(&[("IDP_SHARED_SECRET", "short")])).is_err());
        assert!(Config::from_vars(vars(&[("TRUSTED_PROXIES", "10.0.0.0/33")])).is_err());
        assert!(Config::from_vars(vars(&[("AUDIT_MIN_SEVERITY", "severe")])).is_err());
    }
}
