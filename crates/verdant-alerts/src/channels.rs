//! Notification channels.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertSeverity};

/// A destination alerts are delivered to.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Deliver an alert. Delivery failures are logged by the manager, never
    /// propagated to the emitting pipeline.
    async fn send(&self, alert: &Alert) -> Result<(), ChannelError>;
}

/// Channel delivery error.
#[derive(Debug, thiserror::Error)]
#[error("Channel {channel} failed: {reason}")]
pub struct ChannelError {
    pub channel: String,
    pub reason: String,
}

/// Channel that writes alerts to the tracing log.
pub struct ConsoleChannel {
    name: String,
}

impl ConsoleChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        match alert.severity {
            AlertSeverity::Info => {
                info!(source = %alert.source, title = %alert.title, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(source = %alert.source, title = %alert.title, "{}", alert.message)
            }
            AlertSeverity::Critical | AlertSeverity::Emergency => {
                error!(source = %alert.source, title = %alert.title, "{}", alert.message)
            }
        }
        Ok(())
    }
}

/// Channel that buffers alerts in memory.
///
/// Used by the admin surface for recent-alert listings and by tests to
/// assert on exact emission counts.
pub struct MemoryChannel {
    name: String,
    buffer: Arc<RwLock<Vec<Alert>>>,
    max_size: usize,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(RwLock::new(Vec::new())),
            max_size,
        }
    }

    /// Snapshot of buffered alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.buffer.read().await.clone()
    }

    /// Number of buffered alerts.
    pub async fn len(&self) -> usize {
        self.buffer.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.read().await.is_empty()
    }

    /// Drop all buffered alerts.
    pub async fn clear(&self) {
        self.buffer.write().await.clear();
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let mut buffer = self.buffer.write().await;
        if buffer.len() >= self.max_size {
            buffer.remove(0);
        }
        buffer.push(alert.clone());
        Ok(())
    }
}
