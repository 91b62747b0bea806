use serde_json::{Map, Value};
use tracing::debug;

use crate::agent::credential::AgentStore;
use crate::client::ClientError;
use crate::transport::ApiDescriptor;

/// Reducer path treated as the auth group when no descriptor says otherwise.
pub const AUTH_REDUCER_PATH: &str = "apiAuth";

/// Injects pre-auth material into bodies of identity-establishing calls.
#[derive(Debug, Clone)]
pub struct CredentialBootstrapper {
    agent: AgentStore,
}

impl CredentialBootstrapper {
    pub fn new(agent: AgentStore) -> Self {
        Self { agent }
    }

    pub fn applies_to(api: &ApiDescriptor) -> bool {
        api.auth || api.reducer_path == AUTH_REDUCER_PATH
    }

    /// `login`/`reset` get `$credential`; `register`/`credential` get the
    /// public `credential` descriptor. Other operations are untouched.
    pub async fn prepare(
        &self,
        api: &ApiDescriptor,
        operation: &str,
        body: &mut Option<Value>,
    ) -> Result<(), ClientError> {
        if !Self::applies_to(api) {
            return Ok(());
        }
        let (field, value) = match operation {
            "login" | "reset" => {
                let agent = self.agent.get().await.ok_or(ClientError::MissingCredential)?;
                ("$credential", Value::String(agent.credential_id))
            }
            "register" | "credential" => {
                let credential = self
                    .agent
                    .credential()
                    .await
                    .ok_or(ClientError::MissingCredential)?;
                let value = serde_json::to_value(credential)
                    .map_err(|e| ClientError::Body(e.to_string()))?;
                ("credential", value)
            }
            _ => return Ok(()),
        };

        let object = body
            .get_or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| ClientError::Body(format!("{operation} body must be a JSON object")))?;
        object.insert(field.to_string(), value);
        debug!(operation = %operation, field, "bootstrap material injected");
        Ok(())
    }
}
