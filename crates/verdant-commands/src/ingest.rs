//! Command ingest client.
//!
//! Delivers wire payloads to the command executor's `POST /commands`
//! endpoint. Behind a trait so tests and alternate transports can inject
//! their own implementation.

use async_trait::async_trait;
use serde::Deserialize;

use verdant_core::IngestConfig;

use crate::command::WirePayload;

/// Ingest delivery error types.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Ingest rejected command: HTTP {status}")]
    Status { status: u16 },

    #[error("Malformed ingest response: {0}")]
    MalformedResponse(String),
}

/// Delivery seam to the command executor.
#[async_trait]
pub trait CommandIngest: Send + Sync {
    /// Deliver a command payload; returns the accepted command id.
    async fn submit(&self, payload: &WirePayload) -> Result<String, IngestError>;
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    status: String,
    data: Option<IngestResponseData>,
}

#[derive(Debug, Deserialize)]
struct IngestResponseData {
    command_id: String,
}

/// HTTP ingest client.
pub struct HttpIngestClient {
    config: IngestConfig,
    http_client: reqwest::Client,
}

impl HttpIngestClient {
    /// Create a new client.
    pub fn new(config: IngestConfig) -> Result<Self, IngestError> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn commands_url(&self) -> String {
        format!("{}/commands", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CommandIngest for HttpIngestClient {
    async fn submit(&self, payload: &WirePayload) -> Result<String, IngestError> {
        let response = self
            .http_client
            .post(self.commands_url())
            .json(payload)
            .send()
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IngestError::Status {
                status: response.status().as_u16(),
            });
        }

        let body: IngestResponse = response
            .json()
            .await
            .map_err(|e| IngestError::MalformedResponse(e.to_string()))?;

        if body.status != "ok" {
            return Err(IngestError::MalformedResponse(format!(
                "unexpected status field: {}",
                body.status
            )));
        }

        body.data
            .map(|data| data.command_id)
            .ok_or_else(|| IngestError::MalformedResponse("missing data.command_id".to_string()))
    }
}
