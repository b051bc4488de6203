//! Command descriptor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use verdant_core::{CommandId, ZoneId};

/// A logical actuator command bound for a field node.
///
/// The descriptor itself is immutable once built; only `cmd_id` and the
/// resolved `greenhouse_uid` are attached later by the bus. A `cmd_id` is
/// assigned once per delivery attempt and never reused: when an attempt
/// fails after an id was attached, the bus clears it so a retry mints a
/// fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Tracking id, attached by the bus before delivery
    pub cmd_id: Option<CommandId>,
    /// Zone issuing the command
    pub zone_id: ZoneId,
    /// Target field node
    pub node_uid: String,
    /// Actuator channel on the node
    pub channel: String,
    /// Command verb (e.g. "run_pump", "set_setpoint")
    pub cmd: String,
    /// Opaque verb parameters
    pub params: HashMap<String, serde_json::Value>,
    /// Origin of the command (controller name, operator, schedule)
    pub source: String,
    /// Correlation id for tracing across services
    pub trace_id: String,
    /// Greenhouse the zone belongs to, resolved from the zone store
    pub greenhouse_uid: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Command {
    /// Create a new command for a zone.
    pub fn new(
        zone_id: ZoneId,
        node_uid: impl Into<String>,
        channel: impl Into<String>,
        cmd: impl Into<String>,
    ) -> Self {
        Self {
            cmd_id: None,
            zone_id,
            node_uid: node_uid.into(),
            channel: channel.into(),
            cmd: cmd.into(),
            params: HashMap::new(),
            source: "edge".to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            greenhouse_uid: None,
            created_at: Utc::now(),
        }
    }

    /// Set the verb parameters.
    pub fn with_params(mut self, params: HashMap<String, serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    /// Add a single parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Set the command source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

/// JSON body for the ingest endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePayload {
    pub cmd: String,
    pub params: HashMap<String, serde_json::Value>,
    pub node_uid: String,
    pub channel: String,
    pub zone_id: ZoneId,
    pub greenhouse_uid: Option<String>,
    pub cmd_id: Option<CommandId>,
    pub trace_id: String,
    pub source: String,
}

impl From<&Command> for WirePayload {
    fn from(command: &Command) -> Self {
        Self {
            cmd: command.cmd.clone(),
            params: command.params.clone(),
            node_uid: command.node_uid.clone(),
            channel: command.channel.clone(),
            zone_id: command.zone_id,
            greenhouse_uid: command.greenhouse_uid.clone(),
            cmd_id: command.cmd_id.clone(),
            trace_id: command.trace_id.clone(),
            source: command.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_creation() {
        let cmd = Command::new(1, "nd-irrig-1", "default", "run_pump")
            .with_param("duration_ms", serde_json::json!(60000))
            .with_source("irrigation_controller");

        assert_eq!(cmd.zone_id, 1);
        assert!(cmd.cmd_id.is_none());
        assert!(cmd.greenhouse_uid.is_none());
        assert_eq!(cmd.params["duration_ms"], 60000);
        assert_eq!(cmd.source, "irrigation_controller");
        assert!(!cmd.trace_id.is_empty());
    }

    #[test]
    fn test_wire_payload_carries_attached_id() {
        let mut cmd = Command::new(2, "nd-light-3", "spectrum", "set_level");
        cmd.cmd_id = Some("cmd-42".to_string());
        cmd.greenhouse_uid = Some("gh-north".to_string());

        let payload = WirePayload::from(&cmd);
        assert_eq!(payload.cmd_id.as_deref(), Some("cmd-42"));
        assert_eq!(payload.greenhouse_uid.as_deref(), Some("gh-north"));
        assert_eq!(payload.zone_id, 2);
    }
}
