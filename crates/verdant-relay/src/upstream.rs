//! Upstream control-plane client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use verdant_core::{CommandStatus, RelayConfig};

/// Classified result of one status delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// Upstream accepted the update
    Delivered,
    /// Upstream does not know the command yet; retry later
    ///
    /// A freshly dispatched command can report back before the upstream
    /// system has persisted the command row.
    NotFoundYet,
    /// Any other transport or HTTP failure
    Failed(String),
}

/// Delivery seam to the upstream status endpoint.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn push_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        details: &HashMap<String, serde_json::Value>,
    ) -> UpstreamOutcome;
}

#[derive(Serialize)]
struct StatusBody<'a> {
    status: &'static str,
    #[serde(flatten)]
    details: &'a HashMap<String, serde_json::Value>,
}

/// HTTP client for the upstream status endpoint.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstreamClient {
    pub fn new(base_url: impl Into<String>, config: &RelayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Whether a 404 body carries the "command not persisted yet" code.
    fn is_command_not_found(body: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
            return false;
        };
        let code = value
            .get("error_code")
            .or_else(|| value.get("error").and_then(|e| e.get("code")))
            .and_then(|c| c.as_str());
        code == Some("COMMAND_NOT_FOUND")
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstreamClient {
    async fn push_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        details: &HashMap<String, serde_json::Value>,
    ) -> UpstreamOutcome {
        let url = format!(
            "{}/commands/{}/status",
            self.base_url.trim_end_matches('/'),
            cmd_id
        );
        let body = StatusBody {
            status: status.as_str(),
            details,
        };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return UpstreamOutcome::Failed(format!("transport: {e}")),
        };

        let http_status = response.status();
        if http_status.is_success() {
            debug!(cmd_id, status = %status, "status delivered upstream");
            return UpstreamOutcome::Delivered;
        }

        let text = response.text().await.unwrap_or_default();
        if http_status == reqwest::StatusCode::NOT_FOUND && Self::is_command_not_found(&text) {
            return UpstreamOutcome::NotFoundYet;
        }
        UpstreamOutcome::Failed(format!("HTTP {}: {}", http_status.as_u16(), text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_code_flat() {
        assert!(HttpUpstreamClient::is_command_not_found(
            r#"{"error_code":"COMMAND_NOT_FOUND"}"#
        ));
    }

    #[test]
    fn test_not_found_code_nested() {
        assert!(HttpUpstreamClient::is_command_not_found(
            r#"{"error":{"code":"COMMAND_NOT_FOUND"}}"#
        ));
    }

    #[test]
    fn test_other_404_bodies_are_not_benign() {
        assert!(!HttpUpstreamClient::is_command_not_found(
            r#"{"error_code":"ROUTE_NOT_FOUND"}"#
        ));
        assert!(!HttpUpstreamClient::is_command_not_found("not json"));
        assert!(!HttpUpstreamClient::is_command_not_found(""));
    }
}
