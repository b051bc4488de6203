//! Trait seams for persisted state and the upstream status relay.
//!
//! The tracker and bus depend on these traits rather than on a concrete
//! backend, so tests inject in-memory fakes and production wires the
//! redb-backed stores from `verdant-storage`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::CommandStatus;
use crate::{CommandId, ZoneId};

/// Store access error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Status snapshot read back from the persisted command store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStatus {
    pub status: CommandStatus,
    /// Historical error recorded with a terminal status, if any
    pub error: Option<String>,
}

/// Persisted pending-command row, used for restart recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRow {
    pub cmd_id: CommandId,
    pub zone_id: ZoneId,
    pub node_uid: String,
    pub channel: String,
    pub cmd: String,
    pub status: CommandStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted source of truth for command status.
#[async_trait]
pub trait CommandStatusStore: Send + Sync {
    /// Record a freshly registered pending command.
    async fn insert_pending(&self, row: PendingRow) -> Result<(), StoreError>;

    /// Read the current persisted status for a command.
    async fn get_status(&self, cmd_id: &str) -> Result<Option<PersistedStatus>, StoreError>;

    /// Persist an arbitrary status transition.
    async fn set_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Persist a local confirmation timeout.
    async fn mark_timeout(&self, cmd_id: &str) -> Result<(), StoreError>;

    /// Persist a delivery failure with its error message.
    async fn mark_send_failed(&self, cmd_id: &str, error: &str) -> Result<(), StoreError>;

    /// Load not-yet-terminal commands, ordered `created_at` descending and
    /// `cmd_id` descending as tie-break.
    async fn list_pending(&self) -> Result<Vec<PendingRow>, StoreError>;
}

/// Lookup surface for zone metadata and node ownership.
#[async_trait]
pub trait ZoneDirectory: Send + Sync {
    /// Resolve the greenhouse uid a zone belongs to.
    async fn greenhouse_uid(&self, zone_id: ZoneId) -> Result<Option<String>, StoreError>;

    /// Zone a node is currently assigned to, if any.
    async fn node_assignment(&self, node_uid: &str) -> Result<Option<ZoneId>, StoreError>;
}

/// Outbound relay that carries terminal statuses to the upstream system of
/// record. Implementations guarantee at-least-once delivery; `false` means
/// the direct attempt failed and the update was queued for retry.
#[async_trait]
pub trait StatusRelay: Send + Sync {
    async fn relay_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        details: HashMap<String, serde_json::Value>,
    ) -> bool;
}
