//! Shared client state.
//!
//! Every table sits behind one lock so that an ingested envelope is committed
//! atomically: a reader sees either none or all of a response's logs, bearers
//! and descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::security::otp::OtpSeed;
use crate::transport::{ApiDescriptor, BearerToken, LogEntry, System};

/// Retained log entries; the oldest are dropped beyond this.
pub const LOG_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct Tables {
    systems: HashMap<String, System>,
    active: Option<String>,
    apis: HashMap<(String, String), ApiDescriptor>,
    bearers: HashMap<String, BearerToken>,
    logs: Vec<LogEntry>,
    otp: Option<OtpSeed>,
    entities: HashMap<String, HashMap<String, Value>>,
}

/// Authentication material extracted from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub logs: Vec<LogEntry>,
    pub bearers: Vec<BearerToken>,
    pub apis: Vec<ApiDescriptor>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.bearers.is_empty() && self.apis.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientState {
    inner: Arc<RwLock<Tables>>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_system(&self, system: System) {
        let mut tables = self.inner.write().await;
        tables.systems.insert(system.id.clone(), system);
    }

    /// Makes `system_id` the only active system. Unknown ids are ignored.
    pub async fn activate(&self, system_id: &str) -> bool {
        let mut tables = self.inner.write().await;
        if !tables.systems.contains_key(system_id) {
            warn!(system_id = %system_id, "cannot activate unknown system");
            return false;
        }
        tables.active = Some(system_id.to_string());
        info!(system_id = %system_id, "system activated");
        true
    }

    pub async fn active_system(&self) -> Option<System> {
        let tables = self.inner.read().await;
        tables
            .active
            .as_ref()
            .and_then(|id| tables.systems.get(id))
            .cloned()
    }

    pub async fn system_api(&self, system_id: &str, reducer_path: &str) -> Option<ApiDescriptor> {
        let tables = self.inner.read().await;
        tables
            .apis
            .get(&(system_id.to_string(), reducer_path.to_string()))
            .cloned()
    }

    pub async fn system_apis(&self, system_id: &str) -> Vec<ApiDescriptor> {
        let tables = self.inner.read().await;
        let mut apis: Vec<_> = tables
            .apis
            .iter()
            .filter(|((system, _), _)| system == system_id)
            .map(|(_, api)| api.clone())
            .collect();
        apis.sort_by(|a, b| a.reducer_path.cmp(&b.reducer_path));
        apis
    }

    /// The descriptor that issues bearer tokens for `system_id`.
    pub async fn auth_api(&self, system_id: &str) -> Option<ApiDescriptor> {
        let tables = self.inner.read().await;
        tables
            .apis
            .iter()
            .find(|((system, _), api)| system == system_id && api.auth)
            .map(|(_, api)| api.clone())
    }

    pub async fn bearer(&self, bearer_id: &str) -> Option<BearerToken> {
        self.inner.read().await.bearers.get(bearer_id).cloned()
    }

    pub async fn logs(&self) -> Vec<LogEntry> {
        self.inner.read().await.logs.clone()
    }

    /// Hands over every retained log entry and empties the table.
    pub async fn drain_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.inner.write().await.logs)
    }

    pub async fn set_otp(&self, seed: Option<OtpSeed>) {
        self.inner.write().await.otp = seed;
    }

    pub async fn otp(&self) -> Option<OtpSeed> {
        self.inner.read().await.otp.clone()
    }

    /// Derives the next one-time code and advances an HOTP counter in the
    /// same write, so concurrent decorations never share a code.
    /// `None` when no seed is held.
    pub async fn next_otp_code(&self) -> Result<Option<String>> {
        let mut tables = self.inner.write().await;
        let Some(seed) = tables.otp.as_mut() else {
            return Ok(None);
        };
        let code = seed.current_code()?;
        if let Some(counter) = seed.counter.as_mut() {
            *counter += 1;
        }
        Ok(Some(code))
    }

    /// Applies one response's material in a single write.
    ///
    /// Bearers replace by `$id`; descriptors replace by `($system, reducerPath)`.
    /// A descriptor without `$system` is attributed to the active system.
    pub async fn commit(&self, commit: Commit) {
        if commit.is_empty() {
            return;
        }
        let mut tables = self.inner.write().await;
        let active = tables.active.clone();

        tables.logs.extend(commit.logs);
        if tables.logs.len() > LOG_CAPACITY {
            let excess = tables.logs.len() - LOG_CAPACITY;
            tables.logs.drain(..excess);
            debug!(dropped = excess, "oldest log entries dropped");
        }

        for bearer in commit.bearers {
            debug!(bearer_id = %bearer.id, "bearer committed");
            tables.bearers.insert(bearer.id.clone(), bearer);
        }

        for mut api in commit.apis {
            if api.system.is_none() {
                api.system = active.clone();
            }
            let Some(system) = api.system.clone() else {
                warn!(reducer_path = %api.reducer_path, "descriptor without system dropped");
                continue;
            };
            if api.auth {
                for ((owner, path), other) in tables.apis.iter_mut() {
                    if *owner == system && *path != api.reducer_path && other.auth {
                        warn!(reducer_path = %path, "auth flag moved to {}", api.reducer_path);
                        other.auth = false;
                    }
                }
            }
            debug!(system = %system, reducer_path = %api.reducer_path, "api descriptor committed");
            tables.apis.insert((system, api.reducer_path.clone()), api);
        }
    }

    pub async fn entity(&self, key: &str, id: &str) -> Option<Value> {
        let tables = self.inner.read().await;
        tables.entities.get(key).and_then(|set| set.get(id)).cloned()
    }

    pub async fn entity_count(&self, key: &str) -> usize {
        let tables = self.inner.read().await;
        tables.entities.get(key).map_or(0, HashMap::len)
    }

    pub async fn upsert_entities(&self, key: &str, entities: Vec<(String, Value)>) {
        let mut tables = self.inner.write().await;
        let set = tables.entities.entry(key.to_string()).or_default();
        for (id, entity) in entities {
            set.insert(id, entity);
        }
    }

    pub async fn remove_entities(&self, key: &str, ids: &[String]) {
        let mut tables = self.inner.write().await;
        if let Some(set) = tables.entities.get_mut(key) {
            for id in ids {
                set.remove(id);
            }
        }
    }
}
