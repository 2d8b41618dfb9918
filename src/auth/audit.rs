use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    errors::{AppError, Result},
    models::security::{Mitigation, ThreatEvent, ThreatSeverity},
};

/// Audit configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Whether audit logging is enabled
    pub enabled: bool,
    /// JSON-lines file to append to, if any
    pub log_file_path: Option<PathBuf>,
    /// Number of recent entries kept in memory for the admin API
    pub max_recent: usize,
    /// Minimum severity written to the file
    pub min_severity: ThreatSeverity,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file_path: None,
            max_recent: 500,
            min_severity: ThreatSeverity::Low,
        }
    }
}

/// A threat together with the response that was applied
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(flatten)]
    pub threat: ThreatEvent,
    pub mitigation: Mitigation,
}

/// Append-only sink for threat events
pub struct AuditManager {
    config: AuditConfig,
    recent: RwLock<VecDeque<AuditEntry>>,
}

impl AuditManager {
    pub fn new() -> Self {
        Self::with_config(AuditConfig::default())
    }

    pub fn with_config(config: AuditConfig) -> Self {
        Self {
            recent: RwLock::new(VecDeque::with_capacity(config.max_recent.min(1024))),
            config,
        }
    }

    /// Record a threat. The in-memory ring is always updated; file errors are returned.
    pub async fn record(&self, threat: &ThreatEvent, mitigation: Mitigation) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let entry = AuditEntry { threat: threat.clone(), mitigation };

        {
            let mut recent = self.recent.write().await;
            if recent.len() >= self.config.max_recent.max(1) {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        match &self.config.log_file_path {
            Some(path) if threat.severity >= self.config.min_severity => self.append(path, &entry).await,
            _ => Ok(()),
        }
    }

    async fn append(&self, path: &Path, entry: &AuditEntry) -> Result<()> {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let log_entry = serde_json::to_string(entry)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                warn!("Failed to open audit log {}: {}", path.display(), e);
                AppError::internal(format!("Failed to open audit log file: {}", e))
            })?;

        file.write_all(format!("{}\n", log_entry).as_bytes())
            .await
            .map_err(|e| AppError::internal(format!("Failed to write audit log: {}", e)))?;

        Ok(())
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.recent.read().await.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for AuditManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::security::ThreatType;
    use chrono::Utc;

    fn threat(severity: ThreatSeverity) -> ThreatEvent {
        ThreatEvent::new(
            ThreatType::SessionHijack,
            severity,
            "signals differ",
            "203.0.113.50".parse().unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_ring_keeps_newest() {
        let audit = AuditManager::with_config(AuditConfig { max_recent: 2, ..AuditConfig::default() });
        for severity in [ThreatSeverity::Low, ThreatSeverity::Medium, ThreatSeverity::High] {
            audit.record(&threat(severity), Mitigation::for_severity(severity)).await.unwrap();
        }

        let recent = audit.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].threat.severity, ThreatSeverity::High);
        assert_eq!(recent[1].mitigation, Mitigation::Alert);
    }

    #[tokio::test]
    async fn test_disabled_audit_records_nothing() {
        let path = std::env::temp_dir().join(format!("wardgate-audit-{}.log", uuid::Uuid::new_v4()));
        let audit = AuditManager::with_config(AuditConfig {
            enabled: false,
            log_file_path: Some(path.clone()),
            ..AuditConfig::default()
        });

        audit.record(&threat(ThreatSeverity::Critical), Mitigation::TerminateSession).await.unwrap();

        assert!(audit.recent(10).await.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines() {
        let path = std::env::temp_dir().join(format!("wardgate-audit-{}.log", uuid::Uuid::new_v4()));
        let audit = AuditManager::with_config(AuditConfig {
            log_file_path: Some(path.clone()),
            min_severity: ThreatSeverity::Medium,
            ..AuditConfig::default()
        });

        audit.record(&threat(ThreatSeverity::Low), Mitigation::LogOnly).await.unwrap();
        audit.record(&threat(ThreatSeverity::High), Mitigation::BlockIp).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["threatType"], "session_hijack");
        assert_eq!(value["mitigation"], "block_ip");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
