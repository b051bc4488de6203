//! Alerting for the Verdant edge controller.
//!
//! The command pipeline reports irrecoverable conditions (ownership
//! violations, unconfirmed commands, relay trouble) through one injected
//! [`AlertManager`]. Channels are pluggable; the memory channel doubles as
//! the observability buffer used by the admin surface and the test suites.

pub mod alert;
pub mod channels;
pub mod manager;

pub use alert::{Alert, AlertId, AlertSeverity};
pub use channels::{ConsoleChannel, MemoryChannel, NotificationChannel};
pub use manager::AlertManager;
