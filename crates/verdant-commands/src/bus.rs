//! Command publishing front door.
//!
//! The bus runs every outbound command through the same pipeline:
//! greenhouse resolution, validation, the node-assignment guard, breaker
//! wrapped delivery, tracker registration, and the audit record. Closed-loop
//! callers additionally block on the tracker until the device-reported
//! outcome is known.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use verdant_alerts::{AlertManager, AlertSeverity};
use verdant_core::store::ZoneDirectory;
use verdant_core::{
    BreakerConfig, BusConfig, CommandId, CommandStatus, ZoneEvent, ZoneEventBus, ZoneEventKind,
    ZoneId,
};

use crate::audit::{CommandAudit, MemoryAudit, PublishAttempt, PublishOutcome};
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::command::{Command, WirePayload};
use crate::ingest::CommandIngest;
use crate::tracker::CommandTracker;
use crate::validator::CommandValidator;

/// Terminal classification of a closed-loop publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedLoopStatus {
    /// Device confirmed the commanded effect
    Done,
    /// No terminal status arrived inside the confirmation window
    Timeout,
    /// Delivered, but no tracker could register the command
    TrackerUnavailable,
    /// Delivery itself failed, nothing reached the executor
    SendFailed,
    /// Device reported a non-success terminal status
    Failed(CommandStatus),
}

impl std::fmt::Display for ClosedLoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "DONE"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::TrackerUnavailable => write!(f, "TRACKER_UNAVAILABLE"),
            Self::SendFailed => write!(f, "SEND_FAILED"),
            Self::Failed(status) => write!(f, "{status}"),
        }
    }
}

/// Result of a closed-loop publish.
#[derive(Debug, Clone)]
pub struct ClosedLoopOutcome {
    /// Whether the command reached the ingest endpoint
    pub command_submitted: bool,
    /// Whether the commanded effect was confirmed as `DONE`
    pub effect_confirmed: bool,
    pub terminal_status: ClosedLoopStatus,
    pub error_code: Option<String>,
    pub cmd_id: Option<CommandId>,
}

impl ClosedLoopOutcome {
    fn not_submitted(error_code: impl Into<String>) -> Self {
        Self {
            command_submitted: false,
            effect_confirmed: false,
            terminal_status: ClosedLoopStatus::SendFailed,
            error_code: Some(error_code.into()),
            cmd_id: None,
        }
    }
}

enum Delivery {
    /// Rejected before any network attempt
    Rejected(String),
    /// Breaker open or transport failure
    Failed(String),
    Delivered,
}

/// Builder for [`CommandBus`].
pub struct CommandBusBuilder {
    ingest: Arc<dyn CommandIngest>,
    directory: Arc<dyn ZoneDirectory>,
    events: Arc<ZoneEventBus>,
    alerts: Arc<AlertManager>,
    tracker: Option<CommandTracker>,
    audit: Option<Arc<dyn CommandAudit>>,
    breaker_config: BreakerConfig,
    config: BusConfig,
}

impl CommandBusBuilder {
    pub fn new(
        ingest: Arc<dyn CommandIngest>,
        directory: Arc<dyn ZoneDirectory>,
        events: Arc<ZoneEventBus>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            ingest,
            directory,
            events,
            alerts,
            tracker: None,
            audit: None,
            breaker_config: BreakerConfig::default(),
            config: BusConfig::default(),
        }
    }

    pub fn tracker(mut self, tracker: CommandTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn CommandAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> CommandBus {
        CommandBus {
            validator: CommandValidator::new(),
            breaker: CircuitBreaker::new("command_ingest", &self.breaker_config),
            ingest: self.ingest,
            directory: self.directory,
            tracker: self.tracker,
            audit: self
                .audit
                .unwrap_or_else(|| Arc::new(MemoryAudit::new())),
            events: self.events,
            alerts: self.alerts,
            config: self.config,
        }
    }
}

/// Orchestrates validation, failure isolation, delivery and tracking.
pub struct CommandBus {
    validator: CommandValidator,
    breaker: CircuitBreaker,
    ingest: Arc<dyn CommandIngest>,
    directory: Arc<dyn ZoneDirectory>,
    tracker: Option<CommandTracker>,
    audit: Arc<dyn CommandAudit>,
    events: Arc<ZoneEventBus>,
    alerts: Arc<AlertManager>,
    config: BusConfig,
}

impl CommandBus {
    pub fn builder(
        ingest: Arc<dyn CommandIngest>,
        directory: Arc<dyn ZoneDirectory>,
        events: Arc<ZoneEventBus>,
        alerts: Arc<AlertManager>,
    ) -> CommandBusBuilder {
        CommandBusBuilder::new(ingest, directory, events, alerts)
    }

    /// Breaker state, for health reporting.
    pub fn breaker_state(&self) -> crate::breaker::BreakerState {
        self.breaker.state()
    }

    /// Fire-and-forget publish of an ad hoc command.
    ///
    /// Returns `true` once the ingest endpoint has accepted the payload.
    pub async fn publish(
        &self,
        zone_id: ZoneId,
        node_uid: &str,
        channel: &str,
        cmd: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> bool {
        let mut command = Command::new(zone_id, node_uid, channel, cmd).with_params(params);
        match self.deliver(zone_id, &mut command).await {
            Delivery::Delivered => {
                self.register_tracking(&mut command).await;
                true
            }
            Delivery::Rejected(_) | Delivery::Failed(_) => false,
        }
    }

    /// Publish a pre-built controller command.
    ///
    /// When a tracker is attached and the command carries no id, one is
    /// minted and attached before sending, so the caller's copy and the
    /// wire payload carry the identical id. If tracking registration fails
    /// after delivery the attached id is cleared, so a retry mints a fresh
    /// one instead of reusing a dangling id.
    pub async fn publish_controller_command(
        &self,
        zone_id: ZoneId,
        command: &mut Command,
    ) -> bool {
        if command.node_uid.is_empty() || command.cmd.is_empty() {
            warn!(zone_id, "controller command missing node_uid or cmd");
            return false;
        }
        match self.deliver(zone_id, command).await {
            Delivery::Delivered => {
                self.register_tracking(command).await;
                true
            }
            Delivery::Rejected(_) | Delivery::Failed(_) => false,
        }
    }

    /// Publish a controller command and block until its terminal outcome
    /// is known or the confirmation window elapses.
    pub async fn publish_controller_command_closed_loop(
        &self,
        zone_id: ZoneId,
        command: &mut Command,
        timeout: Duration,
    ) -> ClosedLoopOutcome {
        if command.node_uid.is_empty() || command.cmd.is_empty() {
            return ClosedLoopOutcome::not_submitted("missing node_uid or cmd");
        }

        match self.deliver(zone_id, command).await {
            Delivery::Rejected(reason) => ClosedLoopOutcome::not_submitted(reason),
            Delivery::Failed(reason) => {
                // Any id minted for this failed attempt is stale
                command.cmd_id = None;
                ClosedLoopOutcome::not_submitted(reason)
            }
            Delivery::Delivered => self.confirm_loop(zone_id, command, timeout).await,
        }
    }

    async fn confirm_loop(
        &self,
        zone_id: ZoneId,
        command: &mut Command,
        timeout: Duration,
    ) -> ClosedLoopOutcome {
        let Some(tracker) = &self.tracker else {
            return self.tracker_unavailable(zone_id, command, "no tracker attached").await;
        };

        let mut context = HashMap::new();
        context.insert("source".to_string(), serde_json::json!(command.source));
        context.insert("trace_id".to_string(), serde_json::json!(command.trace_id));

        let cmd_id = match tracker.track_command(command, context).await {
            Ok(cmd_id) => cmd_id,
            Err(e) => {
                return self
                    .tracker_unavailable(zone_id, command, &e.to_string())
                    .await;
            }
        };

        match tracker
            .wait_for_done(&cmd_id, timeout, tracker.poll_interval())
            .await
        {
            Some(true) => {
                info!(cmd_id = %cmd_id, zone_id, "command effect confirmed");
                ClosedLoopOutcome {
                    command_submitted: true,
                    effect_confirmed: true,
                    terminal_status: ClosedLoopStatus::Done,
                    error_code: None,
                    cmd_id: Some(cmd_id),
                }
            }
            Some(false) => {
                // Terminal but not DONE; report the exact persisted status
                let persisted = tracker.persisted_status(&cmd_id).await;
                let status = persisted
                    .as_ref()
                    .map(|p| p.status)
                    .unwrap_or(CommandStatus::Error);
                let error_code = persisted
                    .and_then(|p| p.error)
                    .unwrap_or_else(|| status.as_str().to_string());
                warn!(cmd_id = %cmd_id, zone_id, status = %status, "command ended without effect");
                ClosedLoopOutcome {
                    command_submitted: true,
                    effect_confirmed: false,
                    terminal_status: ClosedLoopStatus::Failed(status),
                    error_code: Some(error_code),
                    cmd_id: Some(cmd_id),
                }
            }
            None => {
                // Force convergence so the store and tracker agree
                tracker
                    .confirm_command_status(
                        &cmd_id,
                        CommandStatus::Timeout,
                        Some("closed-loop confirmation window elapsed".to_string()),
                    )
                    .await;
                warn!(cmd_id = %cmd_id, zone_id, "command confirmation timed out");
                ClosedLoopOutcome {
                    command_submitted: true,
                    effect_confirmed: false,
                    terminal_status: ClosedLoopStatus::Timeout,
                    error_code: Some("TIMEOUT".to_string()),
                    cmd_id: Some(cmd_id),
                }
            }
        }
    }

    async fn tracker_unavailable(
        &self,
        zone_id: ZoneId,
        command: &mut Command,
        reason: &str,
    ) -> ClosedLoopOutcome {
        // The id attached for this attempt must not be reused on retry
        command.cmd_id = None;

        let message = format!("{} delivered but not tracked: {reason}", command.cmd);
        self.events.publish(ZoneEvent::new(
            zone_id,
            ZoneEventKind::TrackerUnavailable,
            message.clone(),
        ));
        self.alerts
            .raise(
                AlertSeverity::Warning,
                "command tracking unavailable",
                message,
                "command_bus",
            )
            .await;

        ClosedLoopOutcome {
            command_submitted: true,
            effect_confirmed: false,
            terminal_status: ClosedLoopStatus::TrackerUnavailable,
            error_code: None,
            cmd_id: None,
        }
    }

    /// Shared delivery pipeline for all publish flavors.
    async fn deliver(&self, zone_id: ZoneId, command: &mut Command) -> Delivery {
        command.zone_id = zone_id;

        // Greenhouse identity always comes from the zone directory, never
        // from the caller.
        command.greenhouse_uid = match self.directory.greenhouse_uid(zone_id).await {
            Ok(uid) => uid,
            Err(e) => {
                warn!(zone_id, error = %e, "greenhouse lookup failed");
                None
            }
        };

        if let Err(e) = self.validator.validate(command) {
            warn!(zone_id, cmd = %command.cmd, error = %e, "command rejected");
            self.events.publish(
                ZoneEvent::new(zone_id, ZoneEventKind::CommandRejected, e.to_string()),
            );
            self.record(command, PublishOutcome::Rejected, Some(e.to_string()))
                .await;
            return Delivery::Rejected(e.to_string());
        }

        if self.config.enforce_node_assignment {
            if let Some(reason) = self.ownership_violation(zone_id, command).await {
                self.record(command, PublishOutcome::Rejected, Some(reason.clone()))
                    .await;
                return Delivery::Rejected(reason);
            }
        }

        if let Some(tracker) = &self.tracker {
            if command.cmd_id.is_none() {
                command.cmd_id = Some(tracker.mint_id());
            }
        }

        let payload = WirePayload::from(&*command);
        match self.breaker.call(|| self.ingest.submit(&payload)).await {
            Ok(accepted_id) => {
                if command.cmd_id.is_none() {
                    command.cmd_id = Some(accepted_id);
                }
                debug!(zone_id, cmd = %command.cmd, cmd_id = ?command.cmd_id, "command delivered");
                self.record(command, PublishOutcome::Delivered, None).await;
                Delivery::Delivered
            }
            Err(BreakerError::Open { name }) => {
                warn!(zone_id, cmd = %command.cmd, breaker = %name, "delivery skipped, circuit open");
                self.record(command, PublishOutcome::CircuitOpen, None).await;
                Delivery::Failed("circuit open".to_string())
            }
            Err(BreakerError::Inner(e)) => {
                warn!(zone_id, cmd = %command.cmd, error = %e, "delivery failed");
                self.record(command, PublishOutcome::TransportFailed, Some(e.to_string()))
                    .await;
                Delivery::Failed(e.to_string())
            }
        }
    }

    /// Node-assignment guard. Returns the rejection reason on mismatch.
    async fn ownership_violation(&self, zone_id: ZoneId, command: &Command) -> Option<String> {
        let assignment = match self.directory.node_assignment(&command.node_uid).await {
            Ok(assignment) => assignment,
            Err(e) => {
                // Guard cannot be verified; refuse rather than bypass it
                warn!(zone_id, node_uid = %command.node_uid, error = %e, "assignment lookup failed");
                None
            }
        };

        match assignment {
            Some(assigned) if assigned == zone_id => None,
            other => {
                let reason = match other {
                    Some(assigned) => format!(
                        "node {} is assigned to zone {assigned}, not zone {zone_id}",
                        command.node_uid
                    ),
                    None => format!("node {} has no zone assignment", command.node_uid),
                };
                self.events.publish(
                    ZoneEvent::new(zone_id, ZoneEventKind::OwnershipViolation, reason.clone()),
                );
                self.alerts
                    .raise(
                        AlertSeverity::Warning,
                        "node ownership violation",
                        reason.clone(),
                        "command_bus",
                    )
                    .await;
                Some(reason)
            }
        }
    }

    async fn register_tracking(&self, command: &mut Command) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        if let Err(e) = tracker.track_command(command, HashMap::new()).await {
            warn!(cmd_id = ?command.cmd_id, error = %e, "tracking registration failed");
            // The id attached for this attempt must not be reused on retry
            command.cmd_id = None;
        }
    }

    async fn record(
        &self,
        command: &Command,
        outcome: PublishOutcome,
        detail: Option<String>,
    ) {
        self.audit
            .record(PublishAttempt::new(
                command.cmd_id.clone(),
                command.zone_id,
                command.node_uid.clone(),
                command.cmd.clone(),
                outcome,
                detail,
            ))
            .await;
    }
}
