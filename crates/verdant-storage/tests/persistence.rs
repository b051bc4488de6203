//! Durability across process restarts.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use verdant_core::store::{CommandStatusStore, PendingRow};
use verdant_core::CommandStatus;
use verdant_storage::{CommandStore, StatusQueueStore, StorageBackend};

fn pending_row(cmd_id: &str, age_secs: i64) -> PendingRow {
    PendingRow {
        cmd_id: cmd_id.to_string(),
        zone_id: 1,
        node_uid: "nd-irrig-1".to_string(),
        channel: "default".to_string(),
        cmd: "run_pump".to_string(),
        status: CommandStatus::Sent,
        error: None,
        created_at: Utc::now() - Duration::seconds(age_secs),
    }
}

#[tokio::test]
async fn pending_commands_survive_reopen_in_restore_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("verdant.redb");

    {
        let backend = Arc::new(StorageBackend::open(&path).unwrap());
        let store = CommandStore::open(backend).unwrap();
        store.insert_pending(pending_row("cmd-old", 120)).await.unwrap();
        store.insert_pending(pending_row("cmd-a", 10)).await.unwrap();
        store.insert_pending(pending_row("cmd-b", 10)).await.unwrap();
        store.insert_pending(pending_row("cmd-done", 5)).await.unwrap();
        store
            .set_status("cmd-done", CommandStatus::Done, None)
            .await
            .unwrap();
    }

    // Fresh handles, same file
    let backend = Arc::new(StorageBackend::open(&path).unwrap());
    let store = CommandStore::open(backend).unwrap();

    let rows = store.list_pending().await.unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.cmd_id.as_str()).collect();
    // Newest first, id descending on equal timestamps, terminals excluded
    assert_eq!(ids, vec!["cmd-b", "cmd-a", "cmd-old"]);
}

#[tokio::test]
async fn queued_status_updates_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("verdant.redb");

    {
        let backend = Arc::new(StorageBackend::open(&path).unwrap());
        let queue = StatusQueueStore::open(backend).unwrap();
        queue
            .enqueue(
                "cmd-1",
                CommandStatus::Done,
                Default::default(),
                8,
                Some("HTTP 502".to_string()),
            )
            .unwrap();
    }

    let backend = Arc::new(StorageBackend::open(&path).unwrap());
    let queue = StatusQueueStore::open(backend).unwrap();

    assert_eq!(queue.live_len().unwrap(), 1);
    let items = queue.pull_due(10).unwrap();
    assert_eq!(items[0].cmd_id, "cmd-1");
    assert_eq!(items[0].last_error.as_deref(), Some("HTTP 502"));

    // The id counter continues past the restart
    let next = queue
        .enqueue("cmd-2", CommandStatus::Error, Default::default(), 8, None)
        .unwrap();
    assert!(next.update_id > items[0].update_id);
}
