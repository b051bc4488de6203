//! Structural command validation.
//!
//! Rejected commands never reach the network; validation failures are never
//! retried.

use crate::command::Command;

/// Validation error types.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Zone id must be non-zero")]
    InvalidZone,

    #[error("Empty parameter key")]
    EmptyParamKey,
}

/// Structural precondition check on an outgoing command.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator;

impl CommandValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a command that is about to be delivered.
    ///
    /// Expects `greenhouse_uid` to already be resolved by the bus; a command
    /// without one must never go on the wire.
    pub fn validate(&self, command: &Command) -> Result<(), ValidationError> {
        if command.cmd.trim().is_empty() {
            return Err(ValidationError::MissingField("cmd"));
        }
        if command.node_uid.trim().is_empty() {
            return Err(ValidationError::MissingField("node_uid"));
        }
        if command.channel.trim().is_empty() {
            return Err(ValidationError::MissingField("channel"));
        }
        if command.zone_id == 0 {
            return Err(ValidationError::InvalidZone);
        }
        if command
            .greenhouse_uid
            .as_deref()
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .is_none()
        {
            return Err(ValidationError::MissingField("greenhouse_uid"));
        }
        if command.params.keys().any(|k| k.trim().is_empty()) {
            return Err(ValidationError::EmptyParamKey);
        }
        Ok(())
    }
}
