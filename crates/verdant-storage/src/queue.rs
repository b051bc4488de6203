//! Status-update retry queue tables.
//!
//! Durable backing for the at-least-once status relay: a live queue of
//! updates awaiting redelivery and a dead-letter table for items that
//! exhausted their retry budget. An update is always in exactly one of the
//! two tables until it is delivered or purged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use verdant_core::{CommandId, CommandStatus};

use crate::backend::StorageBackend;
use crate::error::{Error, Result};
use crate::schema::{write_descriptor, REQUIRED_DLQ_FIELDS, REQUIRED_QUEUE_FIELDS};

const LIVE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("status_updates");
const DLQ_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("status_updates_dlq");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");

const SEQ_KEY: &str = "status_update_seq";

/// A queued status update awaiting redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateItem {
    /// Monotonic id, assigned at enqueue time
    pub update_id: u64,
    /// Command the update belongs to
    pub cmd_id: CommandId,
    /// Status being relayed
    pub status: CommandStatus,
    /// Extra payload fields for the upstream call
    pub details: HashMap<String, serde_json::Value>,
    /// Delivery attempts so far
    pub retry_count: u32,
    /// Attempts allowed before the item moves to the DLQ
    pub max_attempts: u32,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
    /// Enqueue timestamp
    pub created_at: DateTime<Utc>,
    /// Earliest next delivery attempt
    pub next_attempt_at: DateTime<Utc>,
}

impl StatusUpdateItem {
    /// Whether the retry budget is exhausted.
    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.max_attempts
    }
}

/// A dead-lettered status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqItem {
    pub item: StatusUpdateItem,
    pub moved_to_dlq_at: DateTime<Utc>,
}

/// Redb-backed queue store.
pub struct StatusQueueStore {
    backend: Arc<StorageBackend>,
}

impl StatusQueueStore {
    /// Open the store, creating tables and column descriptors when absent.
    pub fn open(backend: Arc<StorageBackend>) -> Result<Self> {
        let txn = backend.db().begin_write()?;
        {
            txn.open_table(LIVE_TABLE)?;
            txn.open_table(DLQ_TABLE)?;
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;

        write_descriptor(&backend, "status_updates", REQUIRED_QUEUE_FIELDS)?;
        write_descriptor(&backend, "status_updates_dlq", REQUIRED_DLQ_FIELDS)?;

        Ok(Self { backend })
    }

    /// Shared backend, for schema verification.
    pub fn backend(&self) -> &Arc<StorageBackend> {
        &self.backend
    }

    /// Append a new item to the live queue.
    pub fn enqueue(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        details: HashMap<String, serde_json::Value>,
        max_attempts: u32,
        last_error: Option<String>,
    ) -> Result<StatusUpdateItem> {
        let txn = self.backend.db().begin_write()?;
        let item = {
            let mut meta = txn.open_table(META_TABLE)?;
            let next_id = meta.get(SEQ_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
            meta.insert(SEQ_KEY, next_id)?;

            let now = Utc::now();
            let item = StatusUpdateItem {
                update_id: next_id,
                cmd_id: cmd_id.to_string(),
                status,
                details,
                retry_count: 0,
                max_attempts,
                last_error,
                created_at: now,
                next_attempt_at: now,
            };

            let mut live = txn.open_table(LIVE_TABLE)?;
            live.insert(item.update_id, bincode::serialize(&item)?.as_slice())?;
            item
        };
        txn.commit()?;

        debug!(update_id = item.update_id, cmd_id, status = %item.status, "status update queued");
        Ok(item)
    }

    /// Pull up to `limit` items whose next attempt is due, oldest first.
    pub fn pull_due(&self, limit: usize) -> Result<Vec<StatusUpdateItem>> {
        let now = Utc::now();
        let txn = self.backend.db().begin_read()?;
        let live = txn.open_table(LIVE_TABLE)?;

        let mut due = Vec::new();
        for entry in live.iter()? {
            let (_, value) = entry?;
            let item: StatusUpdateItem = bincode::deserialize(value.value())?;
            if item.next_attempt_at <= now {
                due.push(item);
                if due.len() >= limit {
                    break;
                }
            }
        }
        Ok(due)
    }

    /// Record a failed attempt and schedule the next one.
    pub fn mark_retry(&self, update_id: u64, delay: Duration, error: &str) -> Result<()> {
        let txn = self.backend.db().begin_write()?;
        {
            let mut live = txn.open_table(LIVE_TABLE)?;
            let mut item: StatusUpdateItem = match live.get(update_id)? {
                Some(value) => bincode::deserialize(value.value())?,
                None => return Err(Error::NotFound(format!("queue item {}", update_id))),
            };

            item.retry_count += 1;
            item.last_error = Some(error.to_string());
            item.next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));

            live.insert(update_id, bincode::serialize(&item)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a delivered item from the live queue.
    pub fn remove(&self, update_id: u64) -> Result<bool> {
        let txn = self.backend.db().begin_write()?;
        let removed = {
            let mut live = txn.open_table(LIVE_TABLE)?;
            // Guard must drop before the table binding
            let removed = live.remove(update_id)?.is_some();
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Move an exhausted item from the live queue to the DLQ.
    pub fn move_to_dlq(&self, update_id: u64) -> Result<bool> {
        let txn = self.backend.db().begin_write()?;
        let moved = {
            let mut live = txn.open_table(LIVE_TABLE)?;
            let item: Option<StatusUpdateItem> = match live.remove(update_id)? {
                Some(value) => Some(bincode::deserialize(value.value())?),
                None => None,
            };

            match item {
                Some(item) => {
                    let record = DlqItem {
                        item,
                        moved_to_dlq_at: Utc::now(),
                    };
                    let mut dlq = txn.open_table(DLQ_TABLE)?;
                    dlq.insert(update_id, bincode::serialize(&record)?.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(moved)
    }

    /// Page through DLQ items, oldest first.
    pub fn list_dlq(&self, limit: usize, offset: usize) -> Result<Vec<DlqItem>> {
        let txn = self.backend.db().begin_read()?;
        let dlq = txn.open_table(DLQ_TABLE)?;

        let mut items = Vec::new();
        for entry in dlq.iter()?.skip(offset).take(limit) {
            let (_, value) = entry?;
            items.push(bincode::deserialize(value.value())?);
        }
        Ok(items)
    }

    /// Move a DLQ item back to the live queue with its retry count reset.
    pub fn replay_dlq(&self, update_id: u64) -> Result<bool> {
        let txn = self.backend.db().begin_write()?;
        let replayed = {
            let mut dlq = txn.open_table(DLQ_TABLE)?;
            let record: Option<DlqItem> = match dlq.remove(update_id)? {
                Some(value) => Some(bincode::deserialize(value.value())?),
                None => None,
            };

            match record {
                Some(record) => {
                    let mut item = record.item;
                    item.retry_count = 0;
                    item.last_error = None;
                    item.next_attempt_at = Utc::now();

                    let mut live = txn.open_table(LIVE_TABLE)?;
                    live.insert(update_id, bincode::serialize(&item)?.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(replayed)
    }

    /// Delete a single DLQ item.
    pub fn purge_dlq(&self, update_id: u64) -> Result<bool> {
        let txn = self.backend.db().begin_write()?;
        let purged = {
            let mut dlq = txn.open_table(DLQ_TABLE)?;
            // Guard must drop before the table binding
            let purged = dlq.remove(update_id)?.is_some();
            purged
        };
        txn.commit()?;
        Ok(purged)
    }

    /// Delete all DLQ items, returning the count removed.
    pub fn purge_dlq_all(&self) -> Result<u64> {
        let txn = self.backend.db().begin_write()?;
        let count = {
            let mut dlq = txn.open_table(DLQ_TABLE)?;
            let ids: Vec<u64> = dlq
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value()))
                .collect::<std::result::Result<_, _>>()?;
            for id in &ids {
                dlq.remove(*id)?;
            }
            ids.len() as u64
        };
        txn.commit()?;
        Ok(count)
    }

    /// Number of items in the live queue.
    pub fn live_len(&self) -> Result<u64> {
        let txn = self.backend.db().begin_read()?;
        let live = txn.open_table(LIVE_TABLE)?;
        Ok(live.len()?)
    }

    /// Number of items in the DLQ.
    pub fn dlq_len(&self) -> Result<u64> {
        let txn = self.backend.db().begin_read()?;
        let dlq = txn.open_table(DLQ_TABLE)?;
        Ok(dlq.len()?)
    }

    /// Age of the oldest live item.
    pub fn oldest_live_age(&self) -> Result<Option<Duration>> {
        let txn = self.backend.db().begin_read()?;
        let live = txn.open_table(LIVE_TABLE)?;

        let mut oldest: Option<DateTime<Utc>> = None;
        for entry in live.iter()? {
            let (_, value) = entry?;
            let item: StatusUpdateItem = bincode::deserialize(value.value())?;
            oldest = Some(match oldest {
                Some(current) if current <= item.created_at => current,
                _ => item.created_at,
            });
        }

        Ok(oldest.map(|created| {
            (Utc::now() - created)
                .to_std()
                .unwrap_or(Duration::ZERO)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> StatusQueueStore {
        StatusQueueStore::open(Arc::new(StorageBackend::ephemeral().unwrap())).unwrap()
    }

    fn enqueue_one(store: &StatusQueueStore, cmd_id: &str) -> StatusUpdateItem {
        store
            .enqueue(cmd_id, CommandStatus::Done, HashMap::new(), 3, None)
            .unwrap()
    }

    #[test]
    fn test_enqueue_assigns_monotonic_ids() {
        let store = open_store();
        let a = enqueue_one(&store, "cmd-a");
        let b = enqueue_one(&store, "cmd-b");
        assert!(b.update_id > a.update_id);
        assert_eq!(store.live_len().unwrap(), 2);
    }

    #[test]
    fn test_pull_due_skips_future_items() {
        let store = open_store();
        let due = enqueue_one(&store, "cmd-a");
        let delayed = enqueue_one(&store, "cmd-b");
        store
            .mark_retry(delayed.update_id, Duration::from_secs(3600), "later")
            .unwrap();

        let pulled = store.pull_due(10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].update_id, due.update_id);
    }

    #[test]
    fn test_mark_retry_increments_and_records_error() {
        let store = open_store();
        let item = enqueue_one(&store, "cmd-a");
        store
            .mark_retry(item.update_id, Duration::from_secs(1), "503 upstream")
            .unwrap();

        // Item is not due for one second, but still resident
        assert_eq!(store.live_len().unwrap(), 1);
        let all = store.pull_due(10).unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_remove_after_delivery() {
        let store = open_store();
        let item = enqueue_one(&store, "cmd-a");
        assert!(store.remove(item.update_id).unwrap());
        assert!(!store.remove(item.update_id).unwrap());
        assert_eq!(store.live_len().unwrap(), 0);
    }

    #[test]
    fn test_dlq_move_replay_purge() {
        let store = open_store();
        let item = enqueue_one(&store, "cmd-a");
        store
            .mark_retry(item.update_id, Duration::ZERO, "boom")
            .unwrap();

        assert!(store.move_to_dlq(item.update_id).unwrap());
        assert_eq!(store.live_len().unwrap(), 0);
        assert_eq!(store.dlq_len().unwrap(), 1);

        let listed = store.list_dlq(10, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].item.cmd_id, "cmd-a");
        assert_eq!(listed[0].item.retry_count, 1);

        // Replay resets the retry budget and goes straight back live
        assert!(store.replay_dlq(item.update_id).unwrap());
        assert_eq!(store.dlq_len().unwrap(), 0);
        let pulled = store.pull_due(10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].retry_count, 0);
        assert!(pulled[0].last_error.is_none());

        // Back to the DLQ, then purge
        assert!(store.move_to_dlq(item.update_id).unwrap());
        assert!(store.purge_dlq(item.update_id).unwrap());
        assert!(!store.purge_dlq(item.update_id).unwrap());
    }

    #[test]
    fn test_purge_dlq_all() {
        let store = open_store();
        for i in 0..3 {
            let item = enqueue_one(&store, &format!("cmd-{}", i));
            store.move_to_dlq(item.update_id).unwrap();
        }
        assert_eq!(store.purge_dlq_all().unwrap(), 3);
        assert_eq!(store.dlq_len().unwrap(), 0);
    }

    #[test]
    fn test_list_dlq_pagination() {
        let store = open_store();
        for i in 0..5 {
            let item = enqueue_one(&store, &format!("cmd-{}", i));
            store.move_to_dlq(item.update_id).unwrap();
        }
        let page = store.list_dlq(2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].item.cmd_id, "cmd-2");
    }

    #[test]
    fn test_oldest_live_age() {
        let store = open_store();
        assert!(store.oldest_live_age().unwrap().is_none());
        enqueue_one(&store, "cmd-a");
        assert!(store.oldest_live_age().unwrap().is_some());
    }
}
