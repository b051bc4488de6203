//! Alert manager.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::alert::{Alert, AlertSeverity};
use crate::channels::NotificationChannel;

/// Routes alerts to all registered channels and keeps a bounded history.
pub struct AlertManager {
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    history: RwLock<Vec<Alert>>,
    max_history_size: usize,
}

impl AlertManager {
    /// Create a manager with no channels registered.
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history_size: 10_000,
        }
    }

    /// Set the maximum history size.
    pub fn with_max_history_size(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self
    }

    /// Register a notification channel.
    pub async fn register_channel(&self, channel: Arc<dyn NotificationChannel>) {
        self.channels.write().await.push(channel);
    }

    /// Create and route an alert.
    pub async fn raise(
        &self,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Alert {
        self.dispatch(Alert::new(severity, title, message, source))
            .await
    }

    /// Route a pre-built alert.
    pub async fn dispatch(&self, alert: Alert) -> Alert {
        {
            let mut history = self.history.write().await;
            if history.len() >= self.max_history_size {
                history.remove(0);
            }
            history.push(alert.clone());
        }

        let channels = self.channels.read().await;
        for channel in channels.iter() {
            if let Err(e) = channel.send(&alert).await {
                warn!(channel = channel.name(), error = %e, "alert delivery failed");
            }
        }

        alert
    }

    /// Snapshot of the alert history, oldest first.
    pub async fn history(&self) -> Vec<Alert> {
        self.history.read().await.clone()
    }

    /// Number of alerts raised since start (bounded by history size).
    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}
