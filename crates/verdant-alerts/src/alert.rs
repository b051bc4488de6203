//! Alert types and severity levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId(pub Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum AlertSeverity {
    /// Informational - no action required
    #[default]
    Info = 0,
    /// Warning - potential issue
    Warning = 1,
    /// Critical - action required
    Critical = 2,
    /// Emergency - immediate action required
    Emergency = 3,
}

impl AlertSeverity {
    /// Get the severity as a string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Alert ID
    pub id: AlertId,
    /// Severity
    pub severity: AlertSeverity,
    /// Short title
    pub title: String,
    /// Detail message
    pub message: String,
    /// Emitting component
    pub source: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Structured context
    pub context: Option<serde_json::Value>,
}

impl Alert {
    /// Create a new alert.
    pub fn new(
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            severity,
            title: title.into(),
            message: message.into(),
            source: source.into(),
            created_at: Utc::now(),
            context: None,
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Emergency > AlertSeverity::Critical);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }

    #[test]
    fn test_alert_creation() {
        let alert = Alert::new(
            AlertSeverity::Warning,
            "command unconfirmed",
            "NO_EFFECT on zone 2",
            "command_bus",
        )
        .with_context(serde_json::json!({"zone_id": 2}));

        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.source, "command_bus");
        assert!(alert.context.is_some());
    }
}
