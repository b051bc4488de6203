//! Reliable command delivery and confirmation for greenhouse zones.
//!
//! Provides:
//! - Command descriptors and structural validation
//! - Circuit breaker isolating the ingest endpoint
//! - Append-only publish audit
//! - In-flight command tracking with persisted-store reconciliation
//! - Command bus with closed-loop effect confirmation

pub mod audit;
pub mod breaker;
pub mod bus;
pub mod command;
pub mod ingest;
pub mod tracker;
pub mod validator;

// Re-exports
pub use command::{Command, WirePayload};

pub use breaker::{BreakerError, BreakerState, CircuitBreaker};

pub use validator::{CommandValidator, ValidationError};

pub use audit::{CommandAudit, MemoryAudit, PublishAttempt, PublishOutcome};

pub use ingest::{CommandIngest, HttpIngestClient, IngestError};

pub use tracker::{CommandTracker, PendingCommand, TrackerError};

pub use bus::{ClosedLoopOutcome, ClosedLoopStatus, CommandBus, CommandBusBuilder};
