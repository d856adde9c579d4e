/// Audit log of kill-switch state changes
///
/// Every privileged operation (state change, reset, verification) is appended
/// as one JSON object per line to `audit.log` in the state directory.
use crate::core::composer::TargetState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SetState,
    Reset,
    Verify,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the audit log in the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event in JSON-lines format.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads up to `count` of the most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn write(event: AuditEvent) {
    if let Ok(audit) = AuditLog::new()
        && let Err(e) = audit.log(event).await
    {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

/// Details recorded for a state change
pub fn state_details(
    state: &TargetState,
    rule_count: usize,
    filter_count: usize,
    fingerprint: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "state": state.name(),
        "target": state,
        "rule_count": rule_count,
        "filter_count": filter_count,
        "fingerprint": fingerprint,
    })
}

/// Logs a state change
pub async fn log_set_state(details: serde_json::Value, success: bool, error: Option<String>) {
    write(AuditEvent::new(EventType::SetState, success, details, error)).await;
}

/// Logs a reset
pub async fn log_reset(success: bool, error: Option<String>) {
    write(AuditEvent::new(
        EventType::Reset,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

/// Logs a verification
pub async fn log_verify(success: bool, error_count: usize, error: Option<String>) {
    write(AuditEvent::new(
        EventType::Verify,
        success,
        serde_json::json!({ "error_count": error_count }),
        error,
    ))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::Verify,
            false,
            serde_json::json!({"error_count": 2}),
            Some("validation failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"verify\""));
        assert!(json.contains("validation failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","event_type":"set_state","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::SetState);
    }

    #[test]
    fn test_state_details() {
        let details = state_details(&TargetState::Blocked, 1, 1, Some("abc"));
        assert_eq!(details["state"], "blocked");
        assert_eq!(details["target"]["state"], "blocked");
        assert_eq!(details["fingerprint"], "abc");
    }

    #[tokio::test]
    async fn test_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        audit
            .log(AuditEvent::new(
                EventType::SetState,
                true,
                state_details(&TargetState::Blocked, 1, 2, None),
                None,
            ))
            .await
            .unwrap();
        audit
            .log(AuditEvent::new(
                EventType::Reset,
                false,
                serde_json::json!({}),
                Some("nft missing".into()),
            ))
            .await
            .unwrap();

        let recent = audit.read_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, EventType::Reset);
        assert_eq!(recent[1].details["filter_count"], 2);
    }
}
