//! End-to-end closed-loop delivery over real redb-backed stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use verdant_alerts::AlertManager;
use verdant_commands::{
    ClosedLoopStatus, Command, CommandBus, CommandIngest, CommandTracker, IngestError, WirePayload,
};
use verdant_core::store::CommandStatusStore;
use verdant_core::{
    BreakerConfig, CommandStatus, RelayConfig, TrackerConfig, ZoneEventBus, ZoneEventKind,
};
use verdant_relay::{StatusUpdateQueue, UpstreamApi, UpstreamOutcome};
use verdant_storage::zones::ZoneRecord;
use verdant_storage::{CommandStore, StatusQueueStore, StorageBackend, ZoneStore};

struct FakeIngest;

#[async_trait]
impl CommandIngest for FakeIngest {
    async fn submit(&self, payload: &WirePayload) -> Result<String, IngestError> {
        Ok(payload
            .cmd_id
            .clone()
            .unwrap_or_else(|| "cmd-accepted".to_string()))
    }
}

struct RecordingUpstream {
    calls: Mutex<Vec<(String, CommandStatus)>>,
}

impl RecordingUpstream {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UpstreamApi for RecordingUpstream {
    async fn push_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        _details: &HashMap<String, serde_json::Value>,
    ) -> UpstreamOutcome {
        self.calls.lock().push((cmd_id.to_string(), status));
        UpstreamOutcome::Delivered
    }
}

struct World {
    bus: CommandBus,
    commands: Arc<CommandStore>,
    upstream: Arc<RecordingUpstream>,
    alerts: Arc<AlertManager>,
    events: Arc<ZoneEventBus>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn world(confirm_timeout_secs: u64) -> World {
    init_tracing();
    let backend = Arc::new(StorageBackend::ephemeral().unwrap());
    let commands = Arc::new(CommandStore::open(backend.clone()).unwrap());
    let zones = Arc::new(ZoneStore::open(backend.clone()).unwrap());
    let queue_store = Arc::new(StatusQueueStore::open(backend).unwrap());

    zones
        .upsert_zone(&ZoneRecord {
            zone_id: 1,
            greenhouse_uid: "gh-north".to_string(),
            name: "north wing".to_string(),
        })
        .unwrap();
    zones
        .upsert_zone(&ZoneRecord {
            zone_id: 2,
            greenhouse_uid: "gh-south".to_string(),
            name: "south wing".to_string(),
        })
        .unwrap();
    zones.assign_node("nd-irrig-1", 1).unwrap();

    let events = Arc::new(ZoneEventBus::new(64));
    let alerts = Arc::new(AlertManager::new());
    let upstream = Arc::new(RecordingUpstream::new());
    let relay = Arc::new(StatusUpdateQueue::new(
        queue_store,
        Some(upstream.clone()),
        alerts.clone(),
        RelayConfig {
            upstream_url: Some("http://upstream.test".to_string()),
            ..RelayConfig::default()
        },
    ));

    let tracker = CommandTracker::new(
        commands.clone(),
        relay,
        events.clone(),
        alerts.clone(),
        TrackerConfig {
            confirm_timeout_secs,
            poll_interval_secs: 1,
        },
    );

    let bus = CommandBus::builder(
        Arc::new(FakeIngest),
        zones,
        events.clone(),
        alerts.clone(),
    )
    .tracker(tracker)
    .breaker_config(BreakerConfig::default())
    .build();

    World {
        bus,
        commands,
        upstream,
        alerts,
        events,
    }
}

#[tokio::test]
async fn closed_loop_confirms_device_reported_done() {
    let w = world(3600);
    let mut cmd = Command::new(1, "nd-irrig-1", "default", "run_pump");
    cmd.cmd_id = Some("cmd-e2e-1".to_string());

    // Device report lands in the store while the bus is waiting
    let commands = w.commands.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        commands
            .set_status("cmd-e2e-1", CommandStatus::Done, None)
            .await
            .unwrap();
    });

    let outcome = w
        .bus
        .publish_controller_command_closed_loop(1, &mut cmd, Duration::from_secs(5))
        .await;

    assert!(outcome.command_submitted);
    assert!(outcome.effect_confirmed);
    assert_eq!(outcome.terminal_status, ClosedLoopStatus::Done);
    assert_eq!(w.alerts.history_len().await, 0);
}

#[tokio::test]
async fn closed_loop_timeout_is_persisted_and_relayed() {
    let w = world(3600);
    let mut cmd = Command::new(1, "nd-irrig-1", "default", "run_pump");
    cmd.cmd_id = Some("cmd-e2e-2".to_string());

    let outcome = w
        .bus
        .publish_controller_command_closed_loop(1, &mut cmd, Duration::from_millis(50))
        .await;

    assert_eq!(outcome.terminal_status, ClosedLoopStatus::Timeout);

    // The store converged on TIMEOUT
    let persisted = w.commands.get_status("cmd-e2e-2").await.unwrap().unwrap();
    assert_eq!(persisted.status, CommandStatus::Timeout);

    // And the upstream heard about it through the relay
    let calls = w.upstream.calls.lock().clone();
    assert_eq!(calls, vec![("cmd-e2e-2".to_string(), CommandStatus::Timeout)]);
}

#[tokio::test]
async fn closed_loop_reports_device_failure_status() {
    let w = world(3600);
    let mut cmd = Command::new(1, "nd-irrig-1", "default", "run_pump");
    cmd.cmd_id = Some("cmd-e2e-3".to_string());

    let commands = w.commands.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        commands
            .set_status(
                "cmd-e2e-3",
                CommandStatus::NoEffect,
                Some("pump already running".to_string()),
            )
            .await
            .unwrap();
    });

    let outcome = w
        .bus
        .publish_controller_command_closed_loop(1, &mut cmd, Duration::from_secs(5))
        .await;

    assert!(!outcome.effect_confirmed);
    assert_eq!(
        outcome.terminal_status,
        ClosedLoopStatus::Failed(CommandStatus::NoEffect)
    );
    assert_eq!(outcome.error_code.as_deref(), Some("pump already running"));
    assert_eq!(w.alerts.history_len().await, 1);
}

#[tokio::test]
async fn ownership_guard_uses_persisted_assignments() {
    let w = world(3600);
    let mut rx = w.events.subscribe();

    // nd-irrig-1 is assigned to zone 1, not zone 2
    let ok = w
        .bus
        .publish(2, "nd-irrig-1", "default", "run_pump", HashMap::new())
        .await;
    assert!(!ok);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, ZoneEventKind::OwnershipViolation);
}
