//! In-flight command tracking.
//!
//! Owns the authoritative in-process view of commands awaiting a terminal
//! outcome and reconciles it against the persisted command store, so the
//! pipeline converges on the device-reported result even when the status
//! relay is delayed. Exactly one record exists per live `cmd_id`; reaching
//! a terminal status evicts the record.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use verdant_alerts::{AlertManager, AlertSeverity};
use verdant_core::store::{CommandStatusStore, PendingRow, PersistedStatus, StatusRelay, StoreError};
use verdant_core::{
    CommandId, CommandStatus, TrackerConfig, ZoneEvent, ZoneEventBus, ZoneEventKind, ZoneId,
};

use crate::command::Command;

/// Tracker error types.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Command already tracked: {0}")]
    AlreadyTracked(CommandId),
}

/// Snapshot of one in-flight command.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub zone_id: ZoneId,
    pub command: Command,
    pub command_type: String,
    pub sent_at: DateTime<Utc>,
    pub status: CommandStatus,
    pub context: HashMap<String, serde_json::Value>,
}

/// Scheduled timeout check for one record.
struct TimeoutTask {
    handle: JoinHandle<()>,
    /// Identity token; a task completing its own confirmation must not
    /// abort itself.
    token: u64,
}

struct PendingEntry {
    info: PendingCommand,
    task: Option<TimeoutTask>,
}

/// Tracks in-flight commands until a terminal outcome is known.
#[derive(Clone)]
pub struct CommandTracker {
    pending: Arc<RwLock<HashMap<CommandId, PendingEntry>>>,
    store: Arc<dyn CommandStatusStore>,
    relay: Arc<dyn StatusRelay>,
    events: Arc<ZoneEventBus>,
    alerts: Arc<AlertManager>,
    config: TrackerConfig,
    next_token: Arc<AtomicU64>,
}

impl CommandTracker {
    /// Create a tracker over the persisted store and status relay.
    pub fn new(
        store: Arc<dyn CommandStatusStore>,
        relay: Arc<dyn StatusRelay>,
        events: Arc<ZoneEventBus>,
        alerts: Arc<AlertManager>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            store,
            relay,
            events,
            alerts,
            config,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mint a fresh command id.
    pub fn mint_id(&self) -> CommandId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Register a delivered command and schedule its timeout check.
    ///
    /// Generates an id when the command carries none, persists the pending
    /// row, and returns the id.
    pub async fn track_command(
        &self,
        command: &Command,
        context: HashMap<String, serde_json::Value>,
    ) -> Result<CommandId, TrackerError> {
        let cmd_id = command
            .cmd_id
            .clone()
            .unwrap_or_else(|| self.mint_id());

        let info = PendingCommand {
            zone_id: command.zone_id,
            command: command.clone(),
            command_type: command.cmd.clone(),
            sent_at: Utc::now(),
            status: CommandStatus::Sent,
            context,
        };
        self.reserve_entry(&cmd_id, info).await?;

        let persisted = self
            .store
            .insert_pending(PendingRow {
                cmd_id: cmd_id.clone(),
                zone_id: command.zone_id,
                node_uid: command.node_uid.clone(),
                channel: command.channel.clone(),
                cmd: command.cmd.clone(),
                status: CommandStatus::Sent,
                error: None,
                created_at: command.created_at,
            })
            .await;
        if let Err(e) = persisted {
            // Release the reservation so a retry can register cleanly
            self.pending.write().await.remove(&cmd_id);
            return Err(e.into());
        }

        self.spawn_timeout(cmd_id.clone()).await;

        debug!(cmd_id = %cmd_id, zone_id = command.zone_id, "command tracked");
        Ok(cmd_id)
    }

    /// Check for a duplicate and reserve the record slot in one critical
    /// section, so two concurrent registrations of the same id can never
    /// both pass.
    async fn reserve_entry(
        &self,
        cmd_id: &CommandId,
        info: PendingCommand,
    ) -> Result<(), TrackerError> {
        let mut pending = self.pending.write().await;
        match pending.entry(cmd_id.clone()) {
            Entry::Occupied(_) => Err(TrackerError::AlreadyTracked(cmd_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry { info, task: None });
                Ok(())
            }
        }
    }

    /// Spawn the timeout check for a reserved record.
    async fn spawn_timeout(&self, cmd_id: CommandId) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let tracker = self.clone();
        let task_cmd_id = cmd_id.clone();
        let handle = tokio::spawn(async move {
            tracker.check_timeout(task_cmd_id, token).await;
        });

        let mut pending = self.pending.write().await;
        match pending.get_mut(&cmd_id) {
            Some(entry) => entry.task = Some(TimeoutTask { handle, token }),
            // Confirmed in the window between reservation and task registration
            None => handle.abort(),
        }
    }

    /// Background deadline check for one pending command.
    async fn check_timeout(&self, cmd_id: CommandId, token: u64) {
        tokio::time::sleep(Duration::from_secs(self.config.confirm_timeout_secs)).await;
        self.handle_deadline(&cmd_id, token).await;
    }

    /// Reconcile a pending command whose local deadline has elapsed.
    async fn handle_deadline(&self, cmd_id: &str, token: u64) {
        let zone_id = {
            let pending = self.pending.read().await;
            match pending.get(cmd_id) {
                Some(entry) => entry.info.zone_id,
                None => return,
            }
        };

        match self.store.get_status(cmd_id).await {
            Ok(Some(persisted)) if persisted.status.is_terminal() => {
                // The store already knows the outcome; converge on it
                // rather than reporting a timeout that never happened.
                debug!(cmd_id, status = %persisted.status, "deadline hit, store terminal");
                self.confirm_internal(cmd_id, persisted.status, persisted.error, Some(token))
                    .await;
            }
            _ => {
                if let Err(e) = self.store.mark_timeout(cmd_id).await {
                    warn!(cmd_id, error = %e, "failed to persist timeout");
                }

                let mut details = HashMap::new();
                details.insert("zone_id".to_string(), serde_json::json!(zone_id));
                details.insert("error_code".to_string(), serde_json::json!("TIMEOUT"));
                let delivered = self
                    .relay
                    .relay_status(cmd_id, CommandStatus::Timeout, details)
                    .await;
                if !delivered {
                    debug!(cmd_id, "timeout status queued for redelivery");
                }

                self.confirm_internal(
                    cmd_id,
                    CommandStatus::Timeout,
                    Some("confirmation window elapsed".to_string()),
                    Some(token),
                )
                .await;
            }
        }
    }

    /// Block (cooperatively) until the persisted store shows a terminal
    /// status or the window elapses.
    ///
    /// Returns `Some(true)` only for `DONE`, `Some(false)` for any other
    /// terminal status, and `None` when nothing terminal was observed in
    /// time. Store read errors count as "nothing observed yet" and are
    /// retried on the next poll.
    pub async fn wait_for_done(
        &self,
        cmd_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<bool> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.store.get_status(cmd_id).await {
                Ok(Some(persisted)) if persisted.status.is_terminal() => {
                    let status = persisted.status;
                    self.confirm_internal(cmd_id, status, persisted.error, None)
                        .await;
                    return Some(status.is_success());
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(cmd_id, error = %e, "status check failed, retrying");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Explicit confirmation entry point for closed-loop callers.
    ///
    /// `Timeout` and `SendFailed` are persisted through their dedicated
    /// writes and relayed upstream before the local record is evicted.
    pub async fn confirm_command_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        error: Option<String>,
    ) {
        let zone_id = {
            let pending = self.pending.read().await;
            pending.get(cmd_id).map(|entry| entry.info.zone_id)
        };

        match status {
            CommandStatus::Timeout => {
                if let Err(e) = self.store.mark_timeout(cmd_id).await {
                    warn!(cmd_id, error = %e, "failed to persist timeout");
                }
                let code = error.clone().unwrap_or_else(|| "TIMEOUT".to_string());
                self.relay_terminal(cmd_id, status, zone_id, code).await;
            }
            CommandStatus::SendFailed => {
                let message = error.clone().unwrap_or_else(|| "send failed".to_string());
                if let Err(e) = self.store.mark_send_failed(cmd_id, &message).await {
                    warn!(cmd_id, error = %e, "failed to persist send failure");
                }
                self.relay_terminal(cmd_id, status, zone_id, message).await;
            }
            _ => {}
        }

        self.confirm_internal(cmd_id, status, error, None).await;
    }

    async fn relay_terminal(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        zone_id: Option<ZoneId>,
        error_code: String,
    ) {
        let mut details = HashMap::new();
        if let Some(zone_id) = zone_id {
            details.insert("zone_id".to_string(), serde_json::json!(zone_id));
        }
        details.insert("error_code".to_string(), serde_json::json!(error_code));
        self.relay.relay_status(cmd_id, status, details).await;
    }

    /// Evict the record, cancel its timeout task, and run the failure
    /// notification path for non-`DONE` terminals.
    ///
    /// `initiated_by` carries the identity token of the timeout task when
    /// that task is the caller, so it is never aborted mid-confirmation.
    async fn confirm_internal(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        error: Option<String>,
        initiated_by: Option<u64>,
    ) {
        let removed = {
            let mut pending = self.pending.write().await;
            pending.remove(cmd_id)
        };
        let Some(entry) = removed else {
            return;
        };

        if let Some(task) = entry.task {
            if initiated_by != Some(task.token) {
                task.handle.abort();
            }
        }

        info!(cmd_id, status = %status, zone_id = entry.info.zone_id, "command confirmed");

        if !status.is_success() {
            let kind = match status {
                CommandStatus::Timeout => ZoneEventKind::CommandTimeout,
                _ => ZoneEventKind::CommandUnconfirmed,
            };
            let message = match &error {
                Some(error) => format!("{} {}: {}", entry.info.command_type, status, error),
                None => format!("{} {}", entry.info.command_type, status),
            };
            self.events.publish(
                ZoneEvent::new(entry.info.zone_id, kind, message.clone()).with_cmd_id(cmd_id),
            );
            self.alerts
                .raise(
                    AlertSeverity::Warning,
                    "command not confirmed",
                    message,
                    "command_tracker",
                )
                .await;
        }
    }

    /// Re-register not-yet-terminal commands after a restart.
    ///
    /// Rows arrive ordered `created_at` descending, `cmd_id` descending, so
    /// polling and timeout behavior resume consistently.
    pub async fn restore_pending_commands(&self) -> Result<usize, TrackerError> {
        let rows = self.store.list_pending().await?;
        let mut count = 0;

        for row in rows {
            let mut command = Command::new(row.zone_id, &row.node_uid, &row.channel, &row.cmd);
            command.cmd_id = Some(row.cmd_id.clone());
            command.created_at = row.created_at;
            command.source = "restored".to_string();

            let info = PendingCommand {
                zone_id: row.zone_id,
                command,
                command_type: row.cmd.clone(),
                sent_at: Utc::now(),
                status: row.status,
                context: HashMap::new(),
            };
            if self.reserve_entry(&row.cmd_id, info).await.is_err() {
                debug!(cmd_id = %row.cmd_id, "already live, skipping restore");
                continue;
            }
            self.spawn_timeout(row.cmd_id).await;
            count += 1;
        }

        if count > 0 {
            info!(count, "pending commands restored");
        }
        Ok(count)
    }

    /// Poll interval for status convergence loops.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs.max(1))
    }

    /// Persisted status snapshot, for closed-loop error reporting.
    pub async fn persisted_status(&self, cmd_id: &str) -> Option<PersistedStatus> {
        self.store.get_status(cmd_id).await.ok().flatten()
    }

    /// Number of live records.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Whether a command is currently tracked.
    pub async fn is_tracked(&self, cmd_id: &str) -> bool {
        self.pending.read().await.contains_key(cmd_id)
    }

    /// Snapshot of all live records.
    pub async fn pending_snapshot(&self) -> Vec<PendingCommand> {
        self.pending
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// In-memory command store fake.
    struct MemStore {
        rows: SyncMutex<HashMap<String, PendingRow>>,
        fail_reads: SyncMutex<bool>,
        fail_inserts: SyncMutex<bool>,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                rows: SyncMutex::new(HashMap::new()),
                fail_reads: SyncMutex::new(false),
                fail_inserts: SyncMutex::new(false),
            }
        }

        fn set_status(&self, cmd_id: &str, status: CommandStatus, error: Option<String>) {
            let mut rows = self.rows.lock();
            if let Some(row) = rows.get_mut(cmd_id) {
                row.status = status;
                row.error = error;
            }
        }

        fn set_fail_reads(&self, fail: bool) {
            *self.fail_reads.lock() = fail;
        }

        fn set_fail_inserts(&self, fail: bool) {
            *self.fail_inserts.lock() = fail;
        }
    }

    #[async_trait]
    impl CommandStatusStore for MemStore {
        async fn insert_pending(&self, row: PendingRow) -> Result<(), StoreError> {
            if *self.fail_inserts.lock() {
                return Err(StoreError::Storage("disk full".to_string()));
            }
            self.rows.lock().insert(row.cmd_id.clone(), row);
            Ok(())
        }

        async fn get_status(&self, cmd_id: &str) -> Result<Option<PersistedStatus>, StoreError> {
            if *self.fail_reads.lock() {
                return Err(StoreError::Storage("db gone".to_string()));
            }
            Ok(self.rows.lock().get(cmd_id).map(|row| PersistedStatus {
                status: row.status,
                error: row.error.clone(),
            }))
        }

        async fn set_status(
            &self,
            cmd_id: &str,
            status: CommandStatus,
            error: Option<String>,
        ) -> Result<(), StoreError> {
            self.set_status(cmd_id, status, error);
            Ok(())
        }

        async fn mark_timeout(&self, cmd_id: &str) -> Result<(), StoreError> {
            self.set_status(cmd_id, CommandStatus::Timeout, None);
            Ok(())
        }

        async fn mark_send_failed(&self, cmd_id: &str, error: &str) -> Result<(), StoreError> {
            self.set_status(cmd_id, CommandStatus::SendFailed, Some(error.to_string()));
            Ok(())
        }

        async fn list_pending(&self) -> Result<Vec<PendingRow>, StoreError> {
            let mut rows: Vec<PendingRow> = self
                .rows
                .lock()
                .values()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect();
            rows.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.cmd_id.cmp(&a.cmd_id))
            });
            Ok(rows)
        }
    }

    /// Relay fake recording every call.
    struct RecordingRelay {
        calls: SyncMutex<Vec<(String, CommandStatus, HashMap<String, serde_json::Value>)>>,
    }

    impl RecordingRelay {
        fn new() -> Self {
            Self {
                calls: SyncMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, CommandStatus, HashMap<String, serde_json::Value>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl StatusRelay for RecordingRelay {
        async fn relay_status(
            &self,
            cmd_id: &str,
            status: CommandStatus,
            details: HashMap<String, serde_json::Value>,
        ) -> bool {
            self.calls
                .lock()
                .push((cmd_id.to_string(), status, details));
            true
        }
    }

    struct Fixture {
        tracker: CommandTracker,
        store: Arc<MemStore>,
        relay: Arc<RecordingRelay>,
        alerts: Arc<AlertManager>,
        events: Arc<ZoneEventBus>,
    }

    fn fixture(confirm_timeout_secs: u64) -> Fixture {
        let store = Arc::new(MemStore::new());
        let relay = Arc::new(RecordingRelay::new());
        let events = Arc::new(ZoneEventBus::new(64));
        let alerts = Arc::new(AlertManager::new());
        let tracker = CommandTracker::new(
            store.clone(),
            relay.clone(),
            events.clone(),
            alerts.clone(),
            TrackerConfig {
                confirm_timeout_secs,
                poll_interval_secs: 1,
            },
        );
        Fixture {
            tracker,
            store,
            relay,
            alerts,
            events,
        }
    }

    fn command() -> Command {
        let mut cmd = Command::new(1, "nd-irrig-1", "default", "run_pump");
        cmd.greenhouse_uid = Some("gh-north".to_string());
        cmd
    }

    #[tokio::test]
    async fn test_track_registers_one_record() {
        let f = fixture(3600);
        let cmd_id = f
            .tracker
            .track_command(&command(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(f.tracker.pending_count().await, 1);
        assert!(f.tracker.is_tracked(&cmd_id).await);
        // Persisted row written at track time
        let persisted = f.store.rows.lock().get(&cmd_id).cloned().unwrap();
        assert_eq!(persisted.status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn test_track_uses_attached_id() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-wire".to_string());

        let cmd_id = f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();
        assert_eq!(cmd_id, "cmd-wire");
    }

    #[tokio::test]
    async fn test_double_track_rejected() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-1".to_string());
        f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();

        let err = f.tracker.track_command(&cmd, HashMap::new()).await;
        assert!(matches!(err, Err(TrackerError::AlreadyTracked(_))));
    }

    #[tokio::test]
    async fn test_concurrent_same_id_tracks_once() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-race".to_string());

        let (a, b) = tokio::join!(
            f.tracker.track_command(&cmd, HashMap::new()),
            f.tracker.track_command(&cmd, HashMap::new()),
        );

        // Exactly one registration wins, whichever order the tasks ran in
        assert_eq!(u32::from(a.is_ok()) + u32::from(b.is_ok()), 1);
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser, Err(TrackerError::AlreadyTracked(_))));
        assert_eq!(f.tracker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_persist_releases_reservation() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-1".to_string());

        f.store.set_fail_inserts(true);
        let err = f.tracker.track_command(&cmd, HashMap::new()).await;
        assert!(matches!(err, Err(TrackerError::Store(_))));
        assert!(!f.tracker.is_tracked("cmd-1").await);

        // Retry succeeds once the store recovers
        f.store.set_fail_inserts(false);
        f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();
        assert!(f.tracker.is_tracked("cmd-1").await);
    }

    #[tokio::test]
    async fn test_wait_for_done_success() {
        let f = fixture(3600);
        let cmd_id = f
            .tracker
            .track_command(&command(), HashMap::new())
            .await
            .unwrap();
        f.store.set_status(&cmd_id, CommandStatus::Done, None);

        let result = f
            .tracker
            .wait_for_done(&cmd_id, Duration::from_secs(1), Duration::from_millis(10))
            .await;
        assert_eq!(result, Some(true));
        // Terminal outcome evicts the record
        assert_eq!(f.tracker.pending_count().await, 0);
        // Full success raises no alert
        assert_eq!(f.alerts.history_len().await, 0);
    }

    #[tokio::test]
    async fn test_wait_for_done_no_effect_is_failure() {
        let f = fixture(3600);
        let mut rx = f.events.subscribe();
        let cmd_id = f
            .tracker
            .track_command(&command(), HashMap::new())
            .await
            .unwrap();
        f.store
            .set_status(&cmd_id, CommandStatus::NoEffect, Some("valve dry".to_string()));

        let result = f
            .tracker
            .wait_for_done(&cmd_id, Duration::from_secs(1), Duration::from_millis(10))
            .await;
        assert_eq!(result, Some(false));
        assert_eq!(f.tracker.pending_count().await, 0);

        // Failure path: exactly one zone event and one alert
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ZoneEventKind::CommandUnconfirmed);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.alerts.history_len().await, 1);
    }

    #[tokio::test]
    async fn test_wait_for_done_times_out() {
        let f = fixture(3600);
        let cmd_id = f
            .tracker
            .track_command(&command(), HashMap::new())
            .await
            .unwrap();

        let result = f
            .tracker
            .wait_for_done(&cmd_id, Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert_eq!(result, None);
        // No terminal status: record stays live
        assert_eq!(f.tracker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_errors_treated_as_pending() {
        let f = fixture(3600);
        let cmd_id = f
            .tracker
            .track_command(&command(), HashMap::new())
            .await
            .unwrap();

        f.store.set_fail_reads(true);
        f.store.set_status(&cmd_id, CommandStatus::Done, None);

        // Reads fail for a while, then recover mid-wait
        let store = f.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            store.set_fail_reads(false);
        });

        let result = f
            .tracker
            .wait_for_done(&cmd_id, Duration::from_secs(2), Duration::from_millis(10))
            .await;
        assert_eq!(result, Some(true));
    }

    #[tokio::test]
    async fn test_deadline_converges_on_persisted_terminal() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-1".to_string());
        f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();
        f.store
            .set_status("cmd-1", CommandStatus::Error, Some("pump jammed".to_string()));

        f.tracker.handle_deadline("cmd-1", u64::MAX).await;

        assert_eq!(f.tracker.pending_count().await, 0);
        // Historical status was confirmed, so no TIMEOUT was relayed
        assert!(f.relay.calls().is_empty());
        // Persisted status untouched by the deadline check
        let persisted = f.store.rows.lock().get("cmd-1").cloned().unwrap();
        assert_eq!(persisted.status, CommandStatus::Error);
        assert_eq!(persisted.error.as_deref(), Some("pump jammed"));
    }

    #[tokio::test]
    async fn test_deadline_confirms_timeout_and_relays() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-1".to_string());
        f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();

        f.tracker.handle_deadline("cmd-1", u64::MAX).await;

        assert_eq!(f.tracker.pending_count().await, 0);
        let persisted = f.store.rows.lock().get("cmd-1").cloned().unwrap();
        assert_eq!(persisted.status, CommandStatus::Timeout);

        let calls = f.relay.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, CommandStatus::Timeout);
        assert_eq!(calls[0].2["zone_id"], serde_json::json!(1));
        assert_eq!(calls[0].2["error_code"], serde_json::json!("TIMEOUT"));

        // Failure path ran exactly once
        assert_eq!(f.alerts.history_len().await, 1);
    }

    #[tokio::test]
    async fn test_confirm_send_failed_persists_and_relays() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-1".to_string());
        f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();

        f.tracker
            .confirm_command_status(
                "cmd-1",
                CommandStatus::SendFailed,
                Some("connection refused".to_string()),
            )
            .await;

        assert_eq!(f.tracker.pending_count().await, 0);
        let persisted = f.store.rows.lock().get("cmd-1").cloned().unwrap();
        assert_eq!(persisted.status, CommandStatus::SendFailed);
        assert_eq!(persisted.error.as_deref(), Some("connection refused"));

        let calls = f.relay.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, CommandStatus::SendFailed);
        assert_eq!(
            calls[0].2["error_code"],
            serde_json::json!("connection refused")
        );
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let f = fixture(3600);
        let mut cmd = command();
        cmd.cmd_id = Some("cmd-1".to_string());
        f.tracker.track_command(&cmd, HashMap::new()).await.unwrap();

        f.tracker
            .confirm_command_status("cmd-1", CommandStatus::Timeout, None)
            .await;
        let alerts_after_first = f.alerts.history_len().await;
        f.tracker
            .confirm_command_status("cmd-1", CommandStatus::Timeout, None)
            .await;

        // Second confirmation found no record: no extra alert
        assert_eq!(f.alerts.history_len().await, alerts_after_first);
    }

    #[tokio::test]
    async fn test_restore_pending_commands() {
        let f = fixture(3600);
        let base = Utc::now();
        for (cmd_id, offset) in [("cmd-a", 30), ("cmd-b", 10), ("cmd-c", 10)] {
            f.store
                .insert_pending(PendingRow {
                    cmd_id: cmd_id.to_string(),
                    zone_id: 2,
                    node_uid: "nd-clim-1".to_string(),
                    channel: "vent".to_string(),
                    cmd: "open_vent".to_string(),
                    status: CommandStatus::Sent,
                    error: None,
                    created_at: base - chrono::Duration::seconds(offset),
                })
                .await
                .unwrap();
        }
        // Terminal rows are not restored
        f.store
            .insert_pending(PendingRow {
                cmd_id: "cmd-done".to_string(),
                zone_id: 2,
                node_uid: "nd-clim-1".to_string(),
                channel: "vent".to_string(),
                cmd: "open_vent".to_string(),
                status: CommandStatus::Done,
                error: None,
                created_at: base,
            })
            .await
            .unwrap();

        let count = f.tracker.restore_pending_commands().await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(f.tracker.pending_count().await, 3);
        assert!(f.tracker.is_tracked("cmd-a").await);
        assert!(!f.tracker.is_tracked("cmd-done").await);
    }
}
