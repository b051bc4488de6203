//! Edge-side status relay.
//!
//! Delivers command status updates to the upstream control plane with
//! at-least-once semantics: a failed direct call lands the update in a
//! persisted retry queue, a background worker redelivers with exponential
//! backoff, and items that exhaust their budget move to a dead-letter
//! queue for operator replay.

pub mod backoff;
pub mod queue;
pub mod upstream;

pub use backoff::retry_delay;
pub use queue::{QueueMetrics, RelayError, StatusUpdateQueue};
pub use upstream::{HttpUpstreamClient, UpstreamApi, UpstreamOutcome};
