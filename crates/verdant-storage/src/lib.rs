//! Persistent storage for the Verdant edge controller.
//!
//! Provides redb-backed stores for:
//! - the `commands` table the tracker reconciles against
//! - the zone directory (greenhouse resolution, node assignments)
//! - the status-update retry queue and its dead-letter table
//! - schema contract descriptors validated at startup

pub mod backend;
pub mod commands;
pub mod error;
pub mod queue;
pub mod schema;
pub mod zones;

pub use backend::StorageBackend;
pub use commands::CommandStore;
pub use error::{Error, Result};
pub use queue::{DlqItem, StatusQueueStore, StatusUpdateItem};
pub use schema::{
    ContractError, SchemaSource, SchemaSourceError, REQUIRED_DLQ_FIELDS, REQUIRED_QUEUE_FIELDS,
};
pub use zones::ZoneStore;
