//! Command status enumeration.
//!
//! The status vocabulary is closed: every status string entering the system
//! passes through [`CommandStatus::normalize`], which rejects unknown tokens
//! and the retired legacy aliases instead of passing them through.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an actuator command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Command registered, not yet on the wire
    Queued,
    /// Command delivered to the ingest endpoint
    Sent,
    /// Device accepted the command
    Ack,
    /// Device completed the command successfully
    Done,
    /// Device ran the command but observed no effect
    NoEffect,
    /// Device reported an execution error
    Error,
    /// Device rejected the command as invalid
    Invalid,
    /// Device was busy and refused the command
    Busy,
    /// No terminal outcome within the confirmation window
    Timeout,
    /// Delivery to the device never succeeded
    SendFailed,
}

impl CommandStatus {
    /// Check if no further transition is expected after this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            CommandStatus::Queued | CommandStatus::Sent | CommandStatus::Ack
        )
    }

    /// Check if this status represents full success.
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Done)
    }

    /// Check if this status may travel on the upstream status relay.
    pub fn relay_allowed(&self) -> bool {
        !matches!(self, CommandStatus::Queued | CommandStatus::Sent)
    }

    /// Canonical wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "QUEUED",
            CommandStatus::Sent => "SENT",
            CommandStatus::Ack => "ACK",
            CommandStatus::Done => "DONE",
            CommandStatus::NoEffect => "NO_EFFECT",
            CommandStatus::Error => "ERROR",
            CommandStatus::Invalid => "INVALID",
            CommandStatus::Busy => "BUSY",
            CommandStatus::Timeout => "TIMEOUT",
            CommandStatus::SendFailed => "SEND_FAILED",
        }
    }

    /// Parse a raw status token.
    ///
    /// The legacy aliases `ACCEPTED` and `FAILED` were retired when the
    /// confirmation protocol started distinguishing "accepted" from
    /// "had effect"; they are rejected here so they can never be stored.
    pub fn normalize(raw: &str) -> Result<Self, StatusError> {
        let token = raw.trim().to_uppercase();
        match token.as_str() {
            "QUEUED" => Ok(CommandStatus::Queued),
            "SENT" => Ok(CommandStatus::Sent),
            "ACK" => Ok(CommandStatus::Ack),
            "DONE" => Ok(CommandStatus::Done),
            "NO_EFFECT" => Ok(CommandStatus::NoEffect),
            "ERROR" => Ok(CommandStatus::Error),
            "INVALID" => Ok(CommandStatus::Invalid),
            "BUSY" => Ok(CommandStatus::Busy),
            "TIMEOUT" => Ok(CommandStatus::Timeout),
            "SEND_FAILED" => Ok(CommandStatus::SendFailed),
            "ACCEPTED" | "FAILED" => Err(StatusError::LegacyAlias(token)),
            _ => Err(StatusError::Unknown(token)),
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status normalization error types.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Unknown command status: {0}")]
    Unknown(String),

    #[error("Legacy status alias rejected: {0}")]
    LegacyAlias(String),
}
