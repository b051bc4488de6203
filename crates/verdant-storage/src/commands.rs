//! Persisted command store.
//!
//! Source of truth the tracker reconciles against. Rows are written when a
//! command is registered and updated by the status ingestion path; once a
//! row reaches a terminal status it never moves back.

use std::sync::Arc;

use async_trait::async_trait;
use redb::{ReadableTable, TableDefinition};
use tracing::debug;

use verdant_core::store::{CommandStatusStore, PendingRow, PersistedStatus, StoreError};
use verdant_core::CommandStatus;

use crate::backend::StorageBackend;
use crate::error::Result;

const COMMANDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("commands");

/// Redb-backed command store.
pub struct CommandStore {
    backend: Arc<StorageBackend>,
}

impl CommandStore {
    /// Open the store, creating the table when absent.
    pub fn open(backend: Arc<StorageBackend>) -> Result<Self> {
        let txn = backend.db().begin_write()?;
        {
            txn.open_table(COMMANDS_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { backend })
    }

    fn read_row(&self, cmd_id: &str) -> Result<Option<PendingRow>> {
        let txn = self.backend.db().begin_read()?;
        let table = txn.open_table(COMMANDS_TABLE)?;
        match table.get(cmd_id)? {
            Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
            None => Ok(None),
        }
    }

    fn write_row(&self, row: &PendingRow) -> Result<()> {
        let encoded = bincode::serialize(row)?;
        let txn = self.backend.db().begin_write()?;
        {
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            table.insert(row.cmd_id.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn update_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<()> {
        let Some(mut row) = self.read_row(cmd_id)? else {
            return Err(crate::error::Error::NotFound(cmd_id.to_string()));
        };

        // First terminal status wins; later writers converge on it.
        if row.status.is_terminal() {
            debug!(cmd_id, current = %row.status, attempted = %status, "terminal status kept");
            return Ok(());
        }

        row.status = status;
        if error.is_some() {
            row.error = error;
        }
        self.write_row(&row)
    }

    /// All rows, for admin listings.
    pub fn list_all(&self) -> Result<Vec<PendingRow>> {
        let txn = self.backend.db().begin_read()?;
        let table = txn.open_table(COMMANDS_TABLE)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            rows.push(bincode::deserialize(value.value())?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl CommandStatusStore for CommandStore {
    async fn insert_pending(&self, row: PendingRow) -> std::result::Result<(), StoreError> {
        self.write_row(&row).map_err(Into::into)
    }

    async fn get_status(
        &self,
        cmd_id: &str,
    ) -> std::result::Result<Option<PersistedStatus>, StoreError> {
        let row = self.read_row(cmd_id).map_err(StoreError::from)?;
        Ok(row.map(|r| PersistedStatus {
            status: r.status,
            error: r.error,
        }))
    }

    async fn set_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> std::result::Result<(), StoreError> {
        self.update_status(cmd_id, status, error).map_err(Into::into)
    }

    async fn mark_timeout(&self, cmd_id: &str) -> std::result::Result<(), StoreError> {
        self.update_status(cmd_id, CommandStatus::Timeout, None)
            .map_err(Into::into)
    }

    async fn mark_send_failed(
        &self,
        cmd_id: &str,
        error: &str,
    ) -> std::result::Result<(), StoreError> {
        self.update_status(cmd_id, CommandStatus::SendFailed, Some(error.to_string()))
            .map_err(Into::into)
    }

    async fn list_pending(&self) -> std::result::Result<Vec<PendingRow>, StoreError> {
        let mut rows: Vec<PendingRow> = self
            .list_all()
            .map_err(StoreError::from)?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();

        // Deterministic restore order: newest first, cmd_id breaks ties.
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.cmd_id.cmp(&a.cmd_id))
        });
        Ok(rows)
    }
}
