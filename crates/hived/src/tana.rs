//! Tana write-back client.
//!
//! Items imported from Tana carry a `tana_node_id`; on completion the
//! worker posts a child note back to the node and checks it off. All of
//! this is non-fatal: a failed write-back is logged and never changes the
//! item outcome.

use async_trait::async_trait;
use hive_core::metadata::TanaMeta;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const INPUT_API_URL: &str = "https://europe-west1-tagr-prod.cloudfunctions.net/addToNodeV2";
const CHECKED_FIELD: &str = "_done";

#[derive(Debug, Error)]
pub enum TanaError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tana api rejected the request: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, TanaError>;

/// Write-back operations the worker performs on a Tana node.
#[async_trait]
pub trait TanaClient: Send + Sync {
    /// Append a child note under the node.
    async fn add_child_note(&self, meta: &TanaMeta, text: &str) -> Result<()>;
    /// Mark the node as checked/done.
    async fn check_node(&self, meta: &TanaMeta) -> Result<()>;
}

/// HTTP client against the Tana Input API.
#[derive(Debug, Clone)]
pub struct HttpTana {
    client: reqwest::Client,
    token: String,
}

impl HttpTana {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            token: token.into(),
        }
    }

    async fn post(&self, payload: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(INPUT_API_URL)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TanaError::Rejected(format!("{status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TanaClient for HttpTana {
    async fn add_child_note(&self, meta: &TanaMeta, text: &str) -> Result<()> {
        self.post(serde_json::json!({
            "targetNodeId": meta.node_id,
            "nodes": [{"name": text}],
        }))
        .await
    }

    async fn check_node(&self, meta: &TanaMeta) -> Result<()> {
        self.post(serde_json::json!({
            "targetNodeId": meta.node_id,
            "setAttributes": {CHECKED_FIELD: true},
        }))
        .await
    }
}

/// No-op client used when no API token is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTana;

#[async_trait]
impl TanaClient for NoopTana {
    async fn add_child_note(&self, meta: &TanaMeta, text: &str) -> Result<()> {
        debug!(node_id = %meta.node_id, text, "tana write-back disabled; skipping note");
        Ok(())
    }

    async fn check_node(&self, meta: &TanaMeta) -> Result<()> {
        debug!(node_id = %meta.node_id, "tana write-back disabled; skipping check");
        Ok(())
    }
}

/// Pick a client from the configured token.
pub fn client_from_token(token: Option<&str>) -> Box<dyn TanaClient> {
    match token {
        Some(token) if !token.is_empty() => Box::new(HttpTana::new(token)),
        _ => Box::new(NoopTana),
    }
}
