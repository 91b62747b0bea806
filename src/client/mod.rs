//! Outgoing call pipeline: resolve, bootstrap, decorate, send, ingest.

pub mod bootstrap;
pub mod decorator;
pub mod ingest;
pub mod registry;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::config::Config;
use crate::agent::credential::{AgentKey, AgentStore};
use crate::security::token_refresh::BearerRefresher;
use crate::state::ClientState;
use crate::transport::{
    Envelope, HttpTransport, System, Transport, TransportError,
};

use bootstrap::CredentialBootstrapper;
use decorator::{AuthDecorator, Outgoing, JSON_CONTENT_TYPE};
use ingest::{CompletedCall, IngestPipeline};
use registry::{join_url, EndpointRegistry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("bearer {bearer_id} unavailable: {reason}")]
    BearerUnavailable { bearer_id: String, reason: String },
    #[error("no agent credential loaded")]
    MissingCredential,
    #[error("challenge unavailable: {0}")]
    Challenge(String),
    #[error("otp derivation failed: {0}")]
    Otp(String),
    #[error("invalid request body: {0}")]
    Body(String),
    #[error("malformed envelope: {0}")]
    Envelope(String),
    #[error("invalid header value: {0}")]
    Header(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Upper bound on waiting for a bearer refresh.
    pub bearer_wait: Duration,
    /// Tokens expiring within this margin count as stale.
    pub bearer_skew: chrono::Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            bearer_wait: Duration::from_secs(config.bearer_wait_secs),
            bearer_skew: chrono::Duration::seconds(
                config.bearer_skew_secs.min(i64::MAX as u64 / 1000) as i64,
            ),
        }
    }
}

/// A fully decorated request, ready for the transport.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

struct Inner {
    state: ClientState,
    agent: AgentStore,
    transport: Arc<dyn Transport>,
    registry: EndpointRegistry,
    bootstrapper: CredentialBootstrapper,
    decorator: AuthDecorator,
    ingest: IngestPipeline,
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        state: ClientState,
        agent: AgentStore,
        options: ClientOptions,
    ) -> Self {
        let ingest = IngestPipeline::standard();
        let decorator = AuthDecorator::new(
            state.clone(),
            agent.clone(),
            transport.clone(),
            ingest.clone(),
            BearerRefresher::new(options.bearer_wait),
            options.bearer_skew,
        );
        Self {
            inner: Arc::new(Inner {
                registry: EndpointRegistry::new(state.clone()),
                bootstrapper: CredentialBootstrapper::new(agent.clone()),
                state,
                agent,
                transport,
                decorator,
                ingest,
            }),
        }
    }

    /// Builds a client over reqwest, loading the agent keyfile when present.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        let key = if Path::new(&config.keyfile).exists() {
            let key = AgentKey::load(&config.keyfile)
                .with_context(|| format!("loading agent keyfile {}", config.keyfile))?;
            info!(credential_id = %key.credential_id, "agent credential loaded");
            Some(key)
        } else {
            warn!(keyfile = %config.keyfile, "no agent keyfile; signed calls will fail");
            None
        };
        Ok(Self::new(
            Arc::new(transport),
            ClientState::new(),
            AgentStore::new(key),
            ClientOptions::from(config),
        ))
    }

    pub fn state(&self) -> &ClientState {
        &self.inner.state
    }

    pub fn agent(&self) -> &AgentStore {
        &self.inner.agent
    }

    /// Fetches a system description, stores it and its descriptors, and
    /// optionally makes it the active system.
    pub async fn load_system(&self, url: &str, set_active: bool) -> Result<System, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        let payload = self.inner.transport.post(url, headers, b"{}".to_vec()).await?;

        let envelope: Envelope<System> = serde_json::from_value(payload.clone())
            .map_err(|e| ClientError::Envelope(e.to_string()))?;
        let Some(system) = envelope.result else {
            let reason = envelope
                .first_error()
                .map(|log| log.title.clone())
                .unwrap_or_else(|| "no system returned".to_string());
            return Err(ClientError::Envelope(reason));
        };

        self.inner.state.insert_system(system.clone()).await;
        if set_active {
            self.inner.state.activate(&system.id).await;
        }
        // descriptors without $system are attributed to the active one,
        // so activation has to precede ingestion
        self.ingest("system", "load", &payload).await;
        info!(system = %system.id, handle = %system.handle, active = set_active, "system loaded");
        Ok(system)
    }

    pub async fn prepare(
        &self,
        reducer_path: &str,
        operation: &str,
        body: Option<Value>,
    ) -> Result<PreparedCall, ClientError> {
        let resolution = self.inner.registry.resolve(reducer_path).await;
        let url = join_url(&resolution.base_url, operation);

        let mut body = body;
        self.inner
            .bootstrapper
            .prepare(&resolution.api, operation, &mut body)
            .await?;
        let bytes = body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| ClientError::Body(e.to_string()))?;

        let headers = self
            .inner
            .decorator
            .decorate(
                &Outgoing {
                    operation,
                    url: &url,
                    body: bytes.as_deref(),
                },
                &resolution,
            )
            .await?;

        debug!(reducer_path = %reducer_path, operation = %operation, url = %url, "call prepared");
        Ok(PreparedCall {
            url,
            headers,
            body: bytes.unwrap_or_default(),
        })
    }

    /// Runs a call and returns the raw payload after ingestion.
    pub async fn call_raw(
        &self,
        reducer_path: &str,
        operation: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let prepared = self.prepare(reducer_path, operation, body).await?;
        let payload = self
            .inner
            .transport
            .post(&prepared.url, prepared.headers, prepared.body)
            .await?;
        self.ingest(reducer_path, operation, &payload).await;
        Ok(payload)
    }

    pub async fn call(
        &self,
        reducer_path: &str,
        operation: &str,
        body: Option<Value>,
    ) -> Result<Envelope, ClientError> {
        let payload = self.call_raw(reducer_path, operation, body).await?;
        serde_json::from_value(payload).map_err(|e| ClientError::Envelope(e.to_string()))
    }

    async fn ingest(&self, reducer_path: &str, operation: &str, payload: &Value) {
        self.inner
            .ingest
            .run(
                &CompletedCall {
                    reducer_path,
                    operation,
                    payload,
                },
                &self.inner.state,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LogLevel;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client() -> ApiClient {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        ApiClient::new(
            Arc::new(transport),
            ClientState::new(),
            AgentStore::new(Some(AgentKey::generate())),
            ClientOptions::default(),
        )
    }

    #[tokio::test]
    async fn load_system_activates_and_stores_descriptors() {
        let mut server = Server::new_async().await;
        let domain = server.url();
        server
            .mock("POST", "/api/sys/system")
            .match_body(Matcher::Exact("{}".into()))
            .with_status(200)
            .with_body(
                json!({
                    "result": {"$id": "sys-1", "handle": "core", "domain": domain},
                    "logs": [],
                    "apis": [
                        {"reducerPath": "apiAuth", "baseUrl": "/api/auth", "auth": true},
                        {"reducerPath": "apiCrud", "baseUrl": "/api/crud", "bearer": ["create"]}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = client();
        let url = format!("{}/api/sys/system", server.url());
        let system = client.load_system(&url, true).await.unwrap();

        assert_eq!(system.handle, "core");
        assert_eq!(client.state().active_system().await, Some(system));
        assert_eq!(client.state().system_apis("sys-1").await.len(), 2);
        assert_eq!(
            client.state().auth_api("sys-1").await.unwrap().reducer_path,
            "apiAuth"
        );
    }

    #[tokio::test]
    async fn load_system_without_result_is_an_envelope_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/system")
            .with_status(200)
            .with_body(r#"{"logs":[{"level":"error","title":"Not Found"}]}"#)
            .create_async()
            .await;

        let err = client()
            .load_system(&format!("{}/system", server.url()), true)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Envelope("Not Found".into()));
    }

    #[tokio::test]
    async fn prepare_without_system_targets_bare_operation() {
        let prepared = client()
            .prepare("apiCrud", "read", Some(json!({"$id": "u1"})))
            .await
            .unwrap();
        assert_eq!(prepared.url, "read");
        assert_eq!(prepared.body, br#"{"$id":"u1"}"#.to_vec());
        assert_eq!(prepared.headers.len(), 1);
    }

    #[tokio::test]
    async fn call_returns_unauthorized_as_envelope() {
        let mut server = Server::new_async().await;
        let client = client();
        client
            .state()
            .insert_system(System {
                id: "sys-1".into(),
                handle: "core".into(),
                domain: server.url(),
            })
            .await;
        client.state().activate("sys-1").await;
        server
            .mock("POST", "/create")
            .with_status(401)
            .with_body(r#"{"logs":[{"level":"error","title":"Unauthorized"}]}"#)
            .create_async()
            .await;

        let envelope = client
            .call("apiCrud", "create", Some(json!({"handle": "newbie"})))
            .await
            .unwrap();
        assert!(envelope.result.is_none());
        assert_eq!(envelope.logs.len(), 1);
        assert_eq!(envelope.logs[0].level, LogLevel::Error);
        assert_eq!(client.state().logs().await[0].title, "Unauthorized");
    }

    #[tokio::test]
    async fn bare_status_errors_propagate() {
        let mut server = Server::new_async().await;
        let client = client();
        client
            .state()
            .insert_system(System {
                id: "sys-1".into(),
                handle: "core".into(),
                domain: server.url(),
            })
            .await;
        client.state().activate("sys-1").await;
        server
            .mock("POST", "/read")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let err = client.call("apiCrud", "read", None).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::Status { status: 502, .. })
        ));
    }
}
