//! Publish audit trail.
//!
//! Append-only side channel recording every publish attempt and its
//! outcome. The pipeline only depends on the call contract; sinks that ship
//! records off-process implement the same trait.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use verdant_core::{CommandId, ZoneId};

/// How a publish attempt ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the ingest endpoint
    Delivered,
    /// Rejected before any network attempt
    Rejected,
    /// Fail-fast, circuit was open
    CircuitOpen,
    /// Transport-level delivery failure
    TransportFailed,
}

/// One recorded publish attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAttempt {
    /// Command id, when one was attached before the attempt ended
    pub cmd_id: Option<CommandId>,
    pub zone_id: ZoneId,
    pub node_uid: String,
    pub cmd: String,
    pub outcome: PublishOutcome,
    /// Rejection reason or transport error, when present
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PublishAttempt {
    pub fn new(
        cmd_id: Option<CommandId>,
        zone_id: ZoneId,
        node_uid: impl Into<String>,
        cmd: impl Into<String>,
        outcome: PublishOutcome,
        detail: Option<String>,
    ) -> Self {
        Self {
            cmd_id,
            zone_id,
            node_uid: node_uid.into(),
            cmd: cmd.into(),
            outcome,
            detail,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only audit sink.
#[async_trait]
pub trait CommandAudit: Send + Sync {
    /// Record one publish attempt. Must never fail the publish path.
    async fn record(&self, attempt: PublishAttempt);
}

/// In-process audit recorder.
pub struct MemoryAudit {
    seq: AtomicU64,
    records: DashMap<u64, PublishAttempt>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            records: DashMap::new(),
        }
    }

    /// Snapshot in insertion order.
    pub fn attempts(&self) -> Vec<PublishAttempt> {
        let mut keyed: Vec<(u64, PublishAttempt)> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        keyed.sort_by_key(|(k, _)| *k);
        keyed.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryAudit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandAudit for MemoryAudit {
    async fn record(&self, attempt: PublishAttempt) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.records.insert(seq, attempt);
    }
}
