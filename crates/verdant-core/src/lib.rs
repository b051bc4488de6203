//! Shared types for the Verdant greenhouse edge controller.
//!
//! Provides:
//! - Command status enumeration with strict wire-token normalization
//! - Zone event bus for lifecycle notifications
//! - Configuration structures for the command pipeline
//! - Trait seams for persisted stores and the upstream status relay

pub mod config;
pub mod events;
pub mod status;
pub mod store;

// Re-exports
pub use config::{
    BreakerConfig, BusConfig, EdgeConfig, IngestConfig, RelayConfig, TrackerConfig,
};
pub use events::{ZoneEvent, ZoneEventBus, ZoneEventKind};
pub use status::{CommandStatus, StatusError};
pub use store::{
    CommandStatusStore, PendingRow, PersistedStatus, StatusRelay, StoreError, ZoneDirectory,
};

/// Unique command identifier.
pub type CommandId = String;

/// Numeric greenhouse zone identifier.
pub type ZoneId = u32;
