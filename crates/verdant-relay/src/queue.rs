//! Status update queue with retry worker and dead-letter handling.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use verdant_alerts::{AlertManager, AlertSeverity};
use verdant_core::store::StatusRelay;
use verdant_core::{CommandStatus, RelayConfig, StatusError};
use verdant_storage::schema::verify_contract;
use verdant_storage::{
    ContractError, DlqItem, SchemaSource, StatusQueueStore, StatusUpdateItem,
    REQUIRED_DLQ_FIELDS, REQUIRED_QUEUE_FIELDS,
};

use crate::backoff::retry_delay;
use crate::upstream::{UpstreamApi, UpstreamOutcome};

const LIVE_TABLE_NAME: &str = "status_updates";
const DLQ_TABLE_NAME: &str = "status_updates_dlq";

/// Outcomes considered for the recent success rate.
const OUTCOME_WINDOW: usize = 100;

/// Relay error types.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Status {0} is not relayed upstream")]
    NotRelayable(CommandStatus),

    #[error("Queue storage error: {0}")]
    Storage(#[from] verdant_storage::Error),
}

/// Point-in-time queue health snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueMetrics {
    pub live_len: u64,
    pub dlq_len: u64,
    pub oldest_live_age_secs: Option<u64>,
    /// Delivery success rate over the recent outcome window
    pub recent_success_rate: Option<f64>,
}

/// At-least-once delivery of command status updates.
///
/// A direct delivery failure enqueues the update; the retry worker
/// redelivers with backoff until success or budget exhaustion.
pub struct StatusUpdateQueue {
    store: Arc<StatusQueueStore>,
    upstream: Option<Arc<dyn UpstreamApi>>,
    alerts: Arc<AlertManager>,
    config: RelayConfig,
    /// Set by a failed schema contract check; a genuine column mismatch
    /// does not heal without operator action.
    schema_error: Mutex<Option<String>>,
    recent_outcomes: Mutex<VecDeque<bool>>,
}

impl StatusUpdateQueue {
    pub fn new(
        store: Arc<StatusQueueStore>,
        upstream: Option<Arc<dyn UpstreamApi>>,
        alerts: Arc<AlertManager>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            upstream,
            alerts,
            config,
            schema_error: Mutex::new(None),
            recent_outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
        }
    }

    /// Startup contract check for the live queue and DLQ tables.
    ///
    /// A missing-column violation is fatal and recorded on the queue. A
    /// transient source failure is retryable and leaves the recorded
    /// schema state untouched, so a later healthy call succeeds normally.
    pub fn ensure_table(&self, source: &dyn SchemaSource) -> Result<(), ContractError> {
        for (table, required) in [
            (LIVE_TABLE_NAME, REQUIRED_QUEUE_FIELDS),
            (DLQ_TABLE_NAME, REQUIRED_DLQ_FIELDS),
        ] {
            match verify_contract(source, table, required) {
                Ok(()) => {}
                Err(e @ ContractError::Violated { .. }) => {
                    warn!(table, error = %e, "schema contract violated");
                    *self.schema_error.lock() = Some(e.to_string());
                    return Err(e);
                }
                Err(e @ ContractError::Unavailable(_)) => {
                    debug!(table, error = %e, "schema check deferred");
                    return Err(e);
                }
            }
        }
        *self.schema_error.lock() = None;
        Ok(())
    }

    /// Recorded schema contract violation, if any.
    pub fn schema_error(&self) -> Option<String> {
        self.schema_error.lock().clone()
    }

    /// Deliver one status update upstream.
    ///
    /// Unknown and legacy-alias status strings are rejected before any
    /// network attempt and never enqueued. Returns `Ok(true)` only when
    /// the upstream accepted the update.
    pub async fn send_status(
        &self,
        cmd_id: &str,
        raw_status: &str,
        details: HashMap<String, serde_json::Value>,
        enqueue_on_failure: bool,
    ) -> Result<bool, RelayError> {
        let status = CommandStatus::normalize(raw_status)?;
        if !status.relay_allowed() {
            return Err(RelayError::NotRelayable(status));
        }
        self.deliver(cmd_id, status, details, enqueue_on_failure).await
    }

    async fn deliver(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        details: HashMap<String, serde_json::Value>,
        enqueue_on_failure: bool,
    ) -> Result<bool, RelayError> {
        let Some(upstream) = &self.upstream else {
            debug!(cmd_id, status = %status, "no upstream configured, status dropped");
            return Ok(false);
        };

        match upstream.push_status(cmd_id, status, &details).await {
            UpstreamOutcome::Delivered => {
                self.record_outcome(true);
                Ok(true)
            }
            UpstreamOutcome::NotFoundYet => {
                self.record_outcome(false);
                if enqueue_on_failure {
                    let item = self.store.enqueue(
                        cmd_id,
                        status,
                        details,
                        self.config.max_attempts,
                        Some("COMMAND_NOT_FOUND".to_string()),
                    )?;
                    info!(cmd_id, update_id = item.update_id, "status deferred, command not yet known upstream");
                    self.alerts
                        .raise(
                            AlertSeverity::Info,
                            "status update deferred",
                            format!("command {cmd_id} not yet known upstream, queued for retry"),
                            "status_relay",
                        )
                        .await;
                }
                Ok(false)
            }
            UpstreamOutcome::Failed(error) => {
                self.record_outcome(false);
                warn!(cmd_id, status = %status, error = %error, "status delivery failed");
                if enqueue_on_failure {
                    self.store.enqueue(
                        cmd_id,
                        status,
                        details,
                        self.config.max_attempts,
                        Some(error),
                    )?;
                }
                Ok(false)
            }
        }
    }

    /// Background redelivery loop.
    ///
    /// Pulls a bounded batch of due items each pass; an empty batch waits
    /// on the shutdown signal alongside the poll sleep so a requested
    /// shutdown is never blocked by an idle queue.
    pub async fn retry_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.retry_interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "status retry worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match self.store.pull_due(self.config.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "failed to pull retry batch");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for item in batch {
                if *shutdown.borrow() {
                    break;
                }
                self.process_item(item).await;
            }
        }

        info!("status retry worker stopped");
    }

    /// Retry one queued item: remove on success, back off or dead-letter
    /// on failure.
    async fn process_item(&self, item: StatusUpdateItem) {
        let outcome = match &self.upstream {
            Some(upstream) => {
                upstream
                    .push_status(&item.cmd_id, item.status, &item.details)
                    .await
            }
            None => UpstreamOutcome::Failed("upstream not configured".to_string()),
        };

        if outcome == UpstreamOutcome::Delivered {
            self.record_outcome(true);
            match self.store.remove(item.update_id) {
                Ok(_) => debug!(
                    cmd_id = %item.cmd_id,
                    update_id = item.update_id,
                    "queued status delivered"
                ),
                Err(e) => warn!(update_id = item.update_id, error = %e, "failed to remove delivered item"),
            }
            return;
        }

        self.record_outcome(false);
        let error = match outcome {
            UpstreamOutcome::NotFoundYet => "COMMAND_NOT_FOUND".to_string(),
            UpstreamOutcome::Failed(error) => error,
            UpstreamOutcome::Delivered => unreachable!(),
        };

        if item.retry_count + 1 >= item.max_attempts {
            match self.store.move_to_dlq(item.update_id) {
                Ok(true) => {
                    warn!(
                        cmd_id = %item.cmd_id,
                        update_id = item.update_id,
                        attempts = item.retry_count + 1,
                        "status update dead-lettered"
                    );
                    self.alerts
                        .raise(
                            AlertSeverity::Warning,
                            "status update dead-lettered",
                            format!(
                                "status {} for command {} failed {} attempts: {error}",
                                item.status,
                                item.cmd_id,
                                item.retry_count + 1
                            ),
                            "status_relay",
                        )
                        .await;
                }
                Ok(false) => {}
                Err(e) => warn!(update_id = item.update_id, error = %e, "failed to dead-letter item"),
            }
            return;
        }

        let delay = retry_delay(
            item.retry_count + 1,
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        );
        if let Err(e) = self.store.mark_retry(item.update_id, delay, &error) {
            warn!(update_id = item.update_id, error = %e, "failed to reschedule item");
        }
    }

    /// Dead-lettered items, newest first.
    pub fn list_dlq(&self, limit: usize, offset: usize) -> Result<Vec<DlqItem>, RelayError> {
        Ok(self.store.list_dlq(limit, offset)?)
    }

    /// Move a DLQ item back into the live queue with a fresh retry budget.
    pub fn replay_dlq_item(&self, update_id: u64) -> Result<bool, RelayError> {
        let replayed = self.store.replay_dlq(update_id)?;
        if replayed {
            info!(update_id, "DLQ item queued for replay");
        }
        Ok(replayed)
    }

    /// Drop one DLQ item.
    pub fn purge_dlq_item(&self, update_id: u64) -> Result<bool, RelayError> {
        Ok(self.store.purge_dlq(update_id)?)
    }

    /// Drop every DLQ item, returning the count removed.
    pub fn purge_dlq_all(&self) -> Result<u64, RelayError> {
        let purged = self.store.purge_dlq_all()?;
        if purged > 0 {
            info!(purged, "DLQ purged");
        }
        Ok(purged)
    }

    /// Queue health snapshot.
    pub fn queue_metrics(&self) -> Result<QueueMetrics, RelayError> {
        let recent_success_rate = {
            let outcomes = self.recent_outcomes.lock();
            if outcomes.is_empty() {
                None
            } else {
                let delivered = outcomes.iter().filter(|ok| **ok).count();
                Some(delivered as f64 / outcomes.len() as f64)
            }
        };

        Ok(QueueMetrics {
            live_len: self.store.live_len()?,
            dlq_len: self.store.dlq_len()?,
            oldest_live_age_secs: self.store.oldest_live_age()?.map(|age| age.as_secs()),
            recent_success_rate,
        })
    }

    fn record_outcome(&self, delivered: bool) {
        let mut outcomes = self.recent_outcomes.lock();
        if outcomes.len() == OUTCOME_WINDOW {
            outcomes.pop_front();
        }
        outcomes.push_back(delivered);
    }
}

#[async_trait]
impl StatusRelay for StatusUpdateQueue {
    async fn relay_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        details: HashMap<String, serde_json::Value>,
    ) -> bool {
        match self.deliver(cmd_id, status, details, true).await {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(cmd_id, error = %e, "status relay failed");
                false
            }
        }
    }
}
