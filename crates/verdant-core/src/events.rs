//! Zone event bus.
//!
//! Broadcast channel for command lifecycle notifications scoped to a zone.
//! Subscribers that lag simply miss events; publishing never blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{CommandId, ZoneId};

/// Zone-level event categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ZoneEventKind {
    /// Command targeted a node not assigned to the zone
    OwnershipViolation,
    /// Command rejected before any delivery attempt
    CommandRejected,
    /// Command reached a terminal failure status
    CommandUnconfirmed,
    /// Command hit the local confirmation deadline
    CommandTimeout,
    /// Closed-loop caller could not obtain tracking
    TrackerUnavailable,
}

/// Event emitted for a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEvent {
    /// Zone the event belongs to
    pub zone_id: ZoneId,
    /// Event category
    pub kind: ZoneEventKind,
    /// Related command, when there is one
    pub cmd_id: Option<CommandId>,
    /// Human-readable detail
    pub message: String,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
}

impl ZoneEvent {
    /// Create a new zone event.
    pub fn new(zone_id: ZoneId, kind: ZoneEventKind, message: impl Into<String>) -> Self {
        Self {
            zone_id,
            kind,
            cmd_id: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the related command id.
    pub fn with_cmd_id(mut self, cmd_id: impl Into<CommandId>) -> Self {
        self.cmd_id = Some(cmd_id.into());
        self
    }
}

/// Broadcast bus for zone events.
pub struct ZoneEventBus {
    sender: broadcast::Sender<ZoneEvent>,
}

impl ZoneEventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ZoneEvent) {
        debug!(
            zone_id = event.zone_id,
            kind = ?event.kind,
            cmd_id = ?event.cmd_id,
            "zone event"
        );
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ZoneEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ZoneEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
