use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Unreachable(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
}

/// Executes one POST and hands back the parsed JSON payload.
///
/// Non-2xx responses that still carry a result envelope are returned as
/// payloads; authorization failures travel as log entries.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, headers: HeaderMap, body: Vec<u8>)
        -> Result<Value, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

fn carries_envelope(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| obj.contains_key("logs"))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<Value, TransportError> {
        trace!(url = %url, bytes = body.len(), "sending POST");

        let resp = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        debug!(url = %url, status_code = status.as_u16(), "received response");

        match serde_json::from_str::<Value>(&text) {
            Ok(value) if status.is_success() || carries_envelope(&value) => Ok(value),
            Err(e) if status.is_success() => Err(TransportError::Decode(e.to_string())),
            _ => Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}
