use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::security::request_signer::compute_signature_base64;

/// Public half of an agent credential. Safe to transmit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDescriptor {
    #[serde(rename = "$id")]
    pub id: String,
    pub name: String,
    pub public_key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    credential_id: String,
    private_key: String,
}

/// An agent's credential id plus its private signing key.
#[derive(Clone)]
pub struct AgentKey {
    pub credential_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKey")
            .field("credential_id", &self.credential_id)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl AgentKey {
    pub fn generate() -> Self {
        Self {
            credential_id: Uuid::new_v4().to_string(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// `private_key` is the base64 32-byte ed25519 seed.
    pub fn from_parts(credential_id: impl Into<String>, private_key: &str) -> Result<Self> {
        let seed = general_purpose::STANDARD
            .decode(private_key.trim())
            .context("decoding private key")?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|v: Vec<u8>| anyhow!("expected 32 seed bytes, got {}", v.len()))?;
        Ok(Self {
            credential_id: credential_id.into(),
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading agent keyfile")?;
        let file: KeyFile = serde_json::from_str(&raw).context("parsing agent keyfile")?;
        Self::from_parts(file.credential_id, &file.private_key)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = KeyFile {
            credential_id: self.credential_id.clone(),
            private_key: general_purpose::STANDARD.encode(self.signing_key.to_bytes()),
        };
        let raw = serde_json::to_string_pretty(&file)?;
        fs::write(path, raw).context("writing agent keyfile")?;
        Ok(())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        compute_signature_base64(&self.signing_key, payload)
    }

    /// Derives the transmittable descriptor. Never includes the private key.
    pub fn credential(&self) -> CredentialDescriptor {
        CredentialDescriptor {
            id: self.credential_id.clone(),
            name: "Agent Credential".to_string(),
            public_key: general_purpose::STANDARD.encode(self.verifying_key().to_bytes()),
        }
    }
}

/// Local credential storage shared by the bootstrapper and decorator.
#[derive(Debug, Clone, Default)]
pub struct AgentStore {
    inner: Arc<RwLock<Option<AgentKey>>>,
}

impl AgentStore {
    pub fn new(key: Option<AgentKey>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(key)),
        }
    }

    pub async fn get(&self) -> Option<AgentKey> {
        self.inner.read().await.clone()
    }

    pub async fn update(&self, key: AgentKey) {
        *self.inner.write().await = Some(key);
    }

    pub async fn credential(&self) -> Option<CredentialDescriptor> {
        self.inner.read().await.as_ref().map(AgentKey::credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::request_signer::verify_signature;
    use tempfile::NamedTempFile;

    #[test]
    fn keyfile_roundtrip_preserves_identity() {
        let key = AgentKey::generate();
        let file = NamedTempFile::new().unwrap();
        key.save(file.path()).unwrap();

        let loaded = AgentKey::load(file.path()).unwrap();
        assert_eq!(loaded.credential_id, key.credential_id);
        assert_eq!(loaded.verifying_key(), key.verifying_key());
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(AgentKey::load("/nonexistent/agent.json").is_err());
    }

    #[test]
    fn short_seed_is_rejected() {
        let err = AgentKey::from_parts("cred", "AAAA").unwrap_err();
        assert!(err.to_string().contains("32 seed bytes"));
    }

    #[test]
    fn credential_descriptor_has_no_private_material() {
        let key = AgentKey::generate();
        let descriptor = serde_json::to_value(key.credential()).unwrap();
        let private = general_purpose::STANDARD.encode(key.signing_key.to_bytes());

        assert_eq!(descriptor["$id"], key.credential_id.as_str());
        assert!(descriptor.get("privateKey").is_none());
        assert!(!descriptor.to_string().contains(&private));
        assert!(!format!("{key:?}").contains(&private));
    }

    #[test]
    fn signatures_verify_with_public_key() {
        let key = AgentKey::generate();
        let sig = key.sign(b"payload");
        assert!(verify_signature(&key.verifying_key(), b"payload", &sig).is_ok());
    }

    #[tokio::test]
    async fn store_update_replaces_key() {
        let store = AgentStore::default();
        assert!(store.get().await.is_none());
        assert!(store.credential().await.is_none());

        let key = AgentKey::generate();
        store.update(key.clone()).await;
        assert_eq!(store.get().await.unwrap().credential_id, key.credential_id);
        assert_eq!(store.credential().await.unwrap().id, key.credential_id);
    }
}
