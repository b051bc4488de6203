//! Configuration for the command pipeline.
//!
//! All sections deserialize from the edge config file and carry defaults
//! matching a small single-greenhouse deployment.

use serde::{Deserialize, Serialize};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before admitting a trial call
    pub open_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 30,
        }
    }
}

/// Command tracker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Seconds before a pending command's local timeout check fires
    pub confirm_timeout_secs: u64,
    /// Poll interval for closed-loop confirmation, in seconds
    pub poll_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: 60,
            poll_interval_secs: 1,
        }
    }
}

/// Command bus behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Reject commands whose target node is not assigned to the zone
    pub enforce_node_assignment: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enforce_node_assignment: true,
        }
    }
}

/// Command ingest endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Base URL of the command executor ingest API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Status relay and retry queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream status endpoint; None disables direct delivery
    pub upstream_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Items pulled per retry worker pass
    pub batch_size: usize,
    /// Retry worker poll interval in seconds
    pub retry_interval_secs: u64,
    /// Delivery attempts before an item moves to the DLQ
    pub max_attempts: u32,
    /// Backoff base delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff delay cap in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            timeout_secs: 10,
            batch_size: 25,
            retry_interval_secs: 5,
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

/// Aggregate edge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}
