pub mod http;

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::security::policy::CapabilityPolicy;

pub use http::{HttpTransport, Transport, TransportError};

/// The deployment a client talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    #[serde(rename = "$id")]
    pub id: String,
    pub handle: String,
    pub domain: String,
}

/// Per-endpoint-group base URL and authentication policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDescriptor {
    pub reducer_path: String,
    #[serde(rename = "$system", default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_id: Option<String>,
    #[serde(default)]
    pub bearer: CapabilityPolicy,
    #[serde(default)]
    pub signature: CapabilityPolicy,
    #[serde(default)]
    pub challenge: CapabilityPolicy,
    #[serde(default)]
    pub otp: CapabilityPolicy,
}

impl ApiDescriptor {
    /// Default descriptor: no base URL suffix, no proofs.
    pub fn new(reducer_path: impl Into<String>) -> Self {
        Self {
            reducer_path: reducer_path.into(),
            system: None,
            base_url: None,
            auth: false,
            bearer_id: None,
            bearer: CapabilityPolicy::Never,
            signature: CapabilityPolicy::Never,
            challenge: CapabilityPolicy::Never,
            otp: CapabilityPolicy::Never,
        }
    }
}

/// Short-lived proof of identity, keyed by its bearer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerToken {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(rename = "$credential", default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub access: String,
    /// Expiry in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl BearerToken {
    /// Tokens without `exp` never go stale client-side.
    pub fn is_stale(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.exp {
            Some(exp) => exp.saturating_sub(skew.num_milliseconds()) <= now.timestamp_millis(),
            None => false,
        }
    }
}

/// Single-use server-minted value proving request freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "$id")]
    pub id: Uuid,
    pub val: String,
    /// Expiry in epoch milliseconds.
    pub exp: i64,
}

impl Challenge {
    pub fn to_header(&self) -> String {
        // serializing a struct of plain fields cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        general_purpose::STANDARD.encode(json)
    }

    pub fn from_header(value: &str) -> Option<Self> {
        let bytes = general_purpose::STANDARD.decode(value.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Success,
    Warning,
    Info,
    Debug,
}

/// Outcome record returned alongside every call result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "$id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub level: LogLevel,
    pub title: String,
    #[serde(default, alias = "description", skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl LogEntry {
    pub fn new(level: LogLevel, title: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id: None,
            level,
            title: title.into(),
            detail,
            created: None,
        }
    }

    pub fn success(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, title, Some(detail.into()))
    }

    pub fn error(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, title, Some(detail.into()))
    }

    /// Fills in identity and creation time for entries committed to state.
    pub fn normalized(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        if self.created.is_none() {
            self.created = Some(Utc::now());
        }
        self
    }
}

/// Result envelope returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearers: Option<Vec<BearerToken>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apis: Option<Vec<ApiDescriptor>>,
}

impl<T> Envelope<T> {
    pub fn ok(result: T, logs: Vec<LogEntry>) -> Self {
        Self {
            result: Some(result),
            logs,
            bearers: None,
            apis: None,
        }
    }

    pub fn failure(log: LogEntry) -> Self {
        Self {
            result: None,
            logs: vec![log],
            bearers: None,
            apis: None,
        }
    }

    pub fn first_error(&self) -> Option<&LogEntry> {
        self.logs
            .iter()
            .find(|log| matches!(log.level, LogLevel::Error | LogLevel::Fatal))
    }
}
