use std::sync::Arc;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use tracing::{debug, warn};

use crate::agent::credential::AgentStore;
use crate::client::bootstrap::CredentialBootstrapper;
use crate::client::ingest::{CompletedCall, IngestPipeline};
use crate::client::registry::{api_base_url, join_url, Resolution};
use crate::client::ClientError;
use crate::security::audit_log::AuditLogger;
use crate::security::otp::OTP_HEADER;
use crate::security::request_signer::SIGNATURE_HEADER;
use crate::security::token_refresh::BearerRefresher;
use crate::state::ClientState;
use crate::transport::{ApiDescriptor, BearerToken, Challenge, Envelope, System, Transport};

pub const CHALLENGE_HEADER: &str = "challenge";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The outgoing call being decorated.
#[derive(Debug, Clone, Copy)]
pub struct Outgoing<'a> {
    pub operation: &'a str,
    pub url: &'a str,
    /// Serialized body; `None` for calls that sign the URL instead.
    pub body: Option<&'a [u8]>,
}

impl Outgoing<'_> {
    fn signed_payload(&self) -> &[u8] {
        self.body.unwrap_or(self.url.as_bytes())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|e| ClientError::Header(e.to_string()))
}

/// Builds the proof headers a call's descriptor asks for.
///
/// Bearer, signature, challenge and OTP are evaluated independently against
/// the operation name; any subset may apply.
#[derive(Clone)]
pub struct AuthDecorator {
    state: ClientState,
    agent: AgentStore,
    bootstrapper: CredentialBootstrapper,
    transport: Arc<dyn Transport>,
    ingest: IngestPipeline,
    refresher: BearerRefresher,
    skew: chrono::Duration,
    audit: AuditLogger,
}

impl AuthDecorator {
    pub fn new(
        state: ClientState,
        agent: AgentStore,
        transport: Arc<dyn Transport>,
        ingest: IngestPipeline,
        refresher: BearerRefresher,
        skew: chrono::Duration,
    ) -> Self {
        Self {
            bootstrapper: CredentialBootstrapper::new(agent.clone()),
            state,
            agent,
            transport,
            ingest,
            refresher,
            skew,
            audit: AuditLogger::new(),
        }
    }

    pub fn refresher(&self) -> &BearerRefresher {
        &self.refresher
    }

    pub async fn decorate(
        &self,
        request: &Outgoing<'_>,
        resolution: &Resolution,
    ) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

        let api = &resolution.api;
        let operation = request.operation;
        let issuer = resolution.system.as_ref().zip(resolution.auth_api.as_ref());

        if let Some((system, auth_api)) = issuer {
            if api.bearer.matches(operation) {
                let bearer_id = api.bearer_id.as_deref().unwrap_or(&system.handle);
                let token = self.bearer(bearer_id, system, auth_api).await?;
                headers.insert(
                    AUTHORIZATION,
                    header_value(&format!("Bearer {}", token.access))?,
                );
            }
        }

        self.attach_proofs(&mut headers, request, api, issuer).await?;
        Ok(headers)
    }

    // Signature, challenge and OTP; shared with the refresh login call.
    async fn attach_proofs(
        &self,
        headers: &mut HeaderMap,
        request: &Outgoing<'_>,
        api: &ApiDescriptor,
        issuer: Option<(&System, &ApiDescriptor)>,
    ) -> Result<(), ClientError> {
        let operation = request.operation;

        if api.signature.matches(operation) {
            let agent = self.agent.get().await.ok_or(ClientError::MissingCredential)?;
            let sig = agent.sign(request.signed_payload());
            headers.insert(SIGNATURE_HEADER, header_value(&sig)?);
            self.audit.signature_attached(&agent.credential_id, operation);
        }

        if let Some((system, auth_api)) = issuer {
            if api.challenge.matches(operation) {
                let challenge = self.challenge(system, auth_api).await?;
                headers.insert(CHALLENGE_HEADER, header_value(&challenge.to_header())?);
            }
        }

        if api.otp.matches(operation) {
            let code = self
                .state
                .next_otp_code()
                .await
                .map_err(|e| ClientError::Otp(e.to_string()))?;
            match code {
                Some(code) => {
                    headers.insert(OTP_HEADER, header_value(&code)?);
                }
                None => warn!(operation = %operation, "otp required but no seed held"),
            }
        }
        Ok(())
    }

    async fn bearer(
        &self,
        bearer_id: &str,
        system: &System,
        auth_api: &ApiDescriptor,
    ) -> Result<BearerToken, ClientError> {
        if let Some(token) = self.state.bearer(bearer_id).await {
            if !token.is_stale(Utc::now(), self.skew) {
                return Ok(token);
            }
            debug!(bearer_id = %bearer_id, "bearer stale");
        }
        // the login outlives any single caller, so it owns its inputs
        let decorator = self.clone();
        let owned = (bearer_id.to_string(), system.clone(), auth_api.clone());
        self.refresher
            .obtain(bearer_id, move || async move {
                let (bearer_id, system, auth_api) = owned;
                decorator.login(&bearer_id, &system, &auth_api).await
            })
            .await
    }

    /// Re-authenticates with the agent credential and reads back the bearer
    /// the response ingestor committed.
    async fn login(
        &self,
        bearer_id: &str,
        system: &System,
        auth_api: &ApiDescriptor,
    ) -> Result<BearerToken, ClientError> {
        let mut body = Some(json!({ "handle": bearer_id }));
        self.bootstrapper.prepare(auth_api, "login", &mut body).await?;
        let bytes = serde_json::to_vec(&body).map_err(|e| ClientError::Body(e.to_string()))?;
        let url = join_url(&api_base_url(system, auth_api), "login");

        let request = Outgoing {
            operation: "login",
            url: &url,
            body: Some(&bytes),
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        self.attach_proofs(&mut headers, &request, auth_api, Some((system, auth_api)))
            .await?;

        let failed = |reason: String| {
            self.audit.bearer_refresh_failed(bearer_id, &reason);
            ClientError::BearerUnavailable {
                bearer_id: bearer_id.to_string(),
                reason,
            }
        };

        let payload = self
            .transport
            .post(&url, headers, bytes)
            .await
            .map_err(|e| failed(e.to_string()))?;
        self.ingest
            .run(
                &CompletedCall {
                    reducer_path: &auth_api.reducer_path,
                    operation: "login",
                    payload: &payload,
                },
                &self.state,
            )
            .await;

        match self.state.bearer(bearer_id).await {
            Some(token) if !token.is_stale(Utc::now(), self.skew) => {
                self.audit
                    .bearer_refreshed(bearer_id, token.credential.as_deref().unwrap_or(""));
                Ok(token)
            }
            _ => {
                let reason = serde_json::from_value::<Envelope>(payload)
                    .ok()
                    .and_then(|env| env.first_error().map(|log| log.title.clone()))
                    .unwrap_or_else(|| "login returned no usable bearer".to_string());
                Err(failed(reason))
            }
        }
    }

    /// Fetches a fresh challenge; never cached across decorations.
    async fn challenge(
        &self,
        system: &System,
        auth_api: &ApiDescriptor,
    ) -> Result<Challenge, ClientError> {
        let url = join_url(&api_base_url(system, auth_api), "challenge");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

        let payload = self.transport.post(&url, headers, b"{}".to_vec()).await?;
        self.ingest
            .run(
                &CompletedCall {
                    reducer_path: &auth_api.reducer_path,
                    operation: "challenge",
                    payload: &payload,
                },
                &self.state,
            )
            .await;

        let envelope: Envelope<Challenge> = serde_json::from_value(payload)
            .map_err(|e| ClientError::Challenge(e.to_string()))?;
        match envelope.result {
            Some(challenge) => Ok(challenge),
            None => Err(ClientError::Challenge(
                envelope
                    .first_error()
                    .map(|log| log.title.clone())
                    .unwrap_or_else(|| "no challenge returned".to_string()),
            )),
        }
    }
}
