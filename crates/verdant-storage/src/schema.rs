//! Schema contract verification.
//!
//! Table layouts are owned by the migration step that provisions the
//! database; the pipeline only verifies at startup that the tables it
//! depends on expose the columns it needs. The three outcomes are kept as
//! distinct types so a transient storage outage can never be mistaken for a
//! permanent schema violation.

use redb::TableDefinition;

use crate::backend::StorageBackend;
use crate::error::Result;

/// Per-table column descriptors, written at provisioning time.
const SCHEMA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("schema_contracts");

/// Columns the live status-update queue table must expose.
pub const REQUIRED_QUEUE_FIELDS: &[&str] = &[
    "update_id",
    "cmd_id",
    "status",
    "details",
    "retry_count",
    "max_attempts",
    "last_error",
    "created_at",
    "next_attempt_at",
];

/// Columns the dead-letter table must expose.
pub const REQUIRED_DLQ_FIELDS: &[&str] = &[
    "update_id",
    "cmd_id",
    "status",
    "details",
    "retry_count",
    "max_attempts",
    "last_error",
    "created_at",
    "next_attempt_at",
    "moved_to_dlq_at",
];

/// Read access to table column descriptors.
pub trait SchemaSource: Send + Sync {
    /// Column names of the given table.
    fn table_fields(&self, table: &str) -> std::result::Result<Vec<String>, SchemaSourceError>;
}

/// Failures while reading a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum SchemaSourceError {
    /// The storage layer could not be reached; retryable.
    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),

    /// No descriptor exists for the table.
    #[error("Table descriptor not found: {0}")]
    MissingTable(String),
}

/// Outcome of a failed contract check.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// The table exists but lacks required columns. Fatal.
    #[error("Schema contract violated for table {table}: missing columns {missing:?}")]
    Violated { table: String, missing: Vec<String> },

    /// The descriptor could not be read right now. Retryable.
    #[error("Schema check deferred, storage unavailable: {0}")]
    Unavailable(String),
}

/// Verify that a table exposes every required column.
pub fn verify_contract(
    source: &dyn SchemaSource,
    table: &str,
    required: &[&str],
) -> std::result::Result<(), ContractError> {
    let fields = match source.table_fields(table) {
        Ok(fields) => fields,
        Err(SchemaSourceError::Unavailable(reason)) => {
            return Err(ContractError::Unavailable(reason));
        }
        Err(SchemaSourceError::MissingTable(name)) => {
            return Err(ContractError::Violated {
                table: name,
                missing: required.iter().map(|s| s.to_string()).collect(),
            });
        }
    };

    let missing: Vec<String> = required
        .iter()
        .filter(|col| !fields.iter().any(|f| f == *col))
        .map(|col| col.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ContractError::Violated {
            table: table.to_string(),
            missing,
        })
    }
}

/// Record a table's column descriptor. Called by the provisioning step.
pub fn write_descriptor(backend: &StorageBackend, table: &str, fields: &[&str]) -> Result<()> {
    let encoded = serde_json::to_vec(fields)?;
    let txn = backend.db().begin_write()?;
    {
        let mut schema = txn.open_table(SCHEMA_TABLE)?;
        schema.insert(table, encoded.as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

impl SchemaSource for StorageBackend {
    fn table_fields(&self, table: &str) -> std::result::Result<Vec<String>, SchemaSourceError> {
        let txn = self
            .db()
            .begin_read()
            .map_err(|e| SchemaSourceError::Unavailable(e.to_string()))?;

        let schema = match txn.open_table(SCHEMA_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Err(SchemaSourceError::MissingTable(table.to_string()));
            }
            Err(e) => return Err(SchemaSourceError::Unavailable(e.to_string())),
        };

        let value = schema
            .get(table)
            .map_err(|e| SchemaSourceError::Unavailable(e.to_string()))?
            .ok_or_else(|| SchemaSourceError::MissingTable(table.to_string()))?;

        serde_json::from_slice(value.value())
            .map_err(|e| SchemaSourceError::Unavailable(e.to_string()))
    }
}
