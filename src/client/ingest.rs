//! Response interceptors run after every completed call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::state::{ClientState, Commit};
use crate::transport::{ApiDescriptor, BearerToken, LogEntry};

/// A finished call as seen by interceptors.
#[derive(Debug, Clone, Copy)]
pub struct CompletedCall<'a> {
    pub reducer_path: &'a str,
    pub operation: &'a str,
    pub payload: &'a Value,
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn intercept(&self, call: &CompletedCall<'_>, state: &ClientState);
}

fn items<T: DeserializeOwned>(payload: &Value, field: &str) -> Option<Vec<T>> {
    let list = payload.get(field)?.as_array()?;
    let parsed = list
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(field, error = %e, "skipping malformed envelope item");
                None
            }
        })
        .collect();
    Some(parsed)
}

/// Commits `logs`, `bearers` and `apis` from a result envelope.
///
/// This is the only writer of bearer tokens and api descriptors.
#[derive(Debug, Clone, Default)]
pub struct ResponseIngestor;

impl ResponseIngestor {
    pub fn extract(payload: &Value) -> Option<Commit> {
        if !payload.is_object() {
            return None;
        }
        let commit = Commit {
            logs: items::<LogEntry>(payload, "logs")
                .unwrap_or_default()
                .into_iter()
                .map(LogEntry::normalized)
                .collect(),
            bearers: items::<BearerToken>(payload, "bearers").unwrap_or_default(),
            apis: items::<ApiDescriptor>(payload, "apis").unwrap_or_default(),
        };
        (!commit.is_empty()).then_some(commit)
    }
}

#[async_trait]
impl ResponseInterceptor for ResponseIngestor {
    async fn intercept(&self, call: &CompletedCall<'_>, state: &ClientState) {
        let Some(commit) = Self::extract(call.payload) else {
            return;
        };
        debug!(
            reducer_path = %call.reducer_path,
            operation = %call.operation,
            logs = commit.logs.len(),
            bearers = commit.bearers.len(),
            apis = commit.apis.len(),
            "ingesting response"
        );
        state.commit(commit).await;
    }
}

/// Upserts CRUD result collections into the generic entity tables.
///
/// `create`, `read` and `update` results map collection keys to entity lists;
/// `delete` results map collection keys to removed ids.
#[derive(Debug, Clone, Default)]
pub struct EntityIngestor;

#[async_trait]
impl ResponseInterceptor for EntityIngestor {
    async fn intercept(&self, call: &CompletedCall<'_>, state: &ClientState) {
        let Some(result) = call.payload.get("result").and_then(Value::as_object) else {
            return;
        };
        match call.operation {
            "create" | "read" | "update" => {
                for (key, list) in result {
                    let Some(list) = list.as_array() else { continue };
                    let entities = list
                        .iter()
                        .filter_map(|entity| {
                            let id = entity.get("$id")?.as_str()?;
                            Some((id.to_string(), entity.clone()))
                        })
                        .collect();
                    state.upsert_entities(key, entities).await;
                }
            }
            "delete" => {
                for (key, ids) in result {
                    let Some(ids) = ids.as_array() else { continue };
                    let ids: Vec<String> = ids
                        .iter()
                        .filter_map(|id| id.as_str().map(String::from))
                        .collect();
                    state.remove_entities(key, &ids).await;
                }
            }
            _ => {}
        }
    }
}

/// Ordered interceptor chain.
#[derive(Clone, Default)]
pub struct IngestPipeline {
    interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl IngestPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        Self::new().with(ResponseIngestor).with(EntityIngestor)
    }

    pub fn with(mut self, interceptor: impl ResponseInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub async fn run(&self, call: &CompletedCall<'_>, state: &ClientState) {
        for interceptor in &self.interceptors {
            interceptor.intercept(call, state).await;
        }
    }
}
