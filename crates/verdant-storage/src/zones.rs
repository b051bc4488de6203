//! Zone directory.
//!
//! Resolves the greenhouse a zone belongs to and the zone a field node is
//! currently assigned to. Assignments are written by the provisioning flow;
//! the command bus only reads them.

use std::sync::Arc;

use async_trait::async_trait;
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use verdant_core::store::{StoreError, ZoneDirectory};
use verdant_core::ZoneId;

use crate::backend::StorageBackend;
use crate::error::Result;

const ZONES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("zones");
const NODE_ASSIGNMENTS_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("node_assignments");

/// Persisted zone metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub zone_id: ZoneId,
    pub greenhouse_uid: String,
    pub name: String,
}

/// Redb-backed zone directory.
pub struct ZoneStore {
    backend: Arc<StorageBackend>,
}

impl ZoneStore {
    /// Open the store, creating tables when absent.
    pub fn open(backend: Arc<StorageBackend>) -> Result<Self> {
        let txn = backend.db().begin_write()?;
        {
            txn.open_table(ZONES_TABLE)?;
            txn.open_table(NODE_ASSIGNMENTS_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { backend })
    }

    /// Create or update a zone record.
    pub fn upsert_zone(&self, record: &ZoneRecord) -> Result<()> {
        let encoded = bincode::serialize(record)?;
        let txn = self.backend.db().begin_write()?;
        {
            let mut zones = txn.open_table(ZONES_TABLE)?;
            zones.insert(record.zone_id as u64, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Assign a node to a zone, replacing any previous assignment.
    pub fn assign_node(&self, node_uid: &str, zone_id: ZoneId) -> Result<()> {
        let txn = self.backend.db().begin_write()?;
        {
            let mut assignments = txn.open_table(NODE_ASSIGNMENTS_TABLE)?;
            assignments.insert(node_uid, zone_id as u64)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a node's assignment.
    pub fn unassign_node(&self, node_uid: &str) -> Result<bool> {
        let txn = self.backend.db().begin_write()?;
        let removed = {
            let mut assignments = txn.open_table(NODE_ASSIGNMENTS_TABLE)?;
            // Guard must drop before the table binding
            let removed = assignments.remove(node_uid)?.is_some();
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Read a zone record.
    pub fn get_zone(&self, zone_id: ZoneId) -> Result<Option<ZoneRecord>> {
        let txn = self.backend.db().begin_read()?;
        let zones = txn.open_table(ZONES_TABLE)?;
        match zones.get(zone_id as u64)? {
            Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ZoneDirectory for ZoneStore {
    async fn greenhouse_uid(
        &self,
        zone_id: ZoneId,
    ) -> std::result::Result<Option<String>, StoreError> {
        let record = self.get_zone(zone_id).map_err(StoreError::from)?;
        Ok(record.map(|r| r.greenhouse_uid))
    }

    async fn node_assignment(
        &self,
        node_uid: &str,
    ) -> std::result::Result<Option<ZoneId>, StoreError> {
        let txn = self
            .backend
            .db()
            .begin_read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let assignments = txn
            .open_table(NODE_ASSIGNMENTS_TABLE)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let zone = assignments
            .get(node_uid)
            .map_err(|e| StoreError::Storage(e.to_string()))?
            .map(|v| v.value() as ZoneId);
        Ok(zone)
    }
}
