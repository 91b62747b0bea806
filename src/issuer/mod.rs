//! Server half of the challenge protocol.

use tracing::{debug, error};

use crate::security::audit_log::AuditLogger;
use crate::security::replay::{ChallengeError, ChallengeStore};
use crate::transport::{Challenge, Envelope, LogEntry};

pub const CREATION_FAILED: &str = "Challenge Creation Failed";

#[derive(Debug, Clone)]
pub struct ChallengeIssuer {
    store: ChallengeStore,
    audit: AuditLogger,
}

impl ChallengeIssuer {
    pub fn new(ttl_secs: u64, capacity: usize) -> Self {
        Self {
            store: ChallengeStore::new(ttl_secs, capacity),
            audit: AuditLogger::new(),
        }
    }

    pub fn store(&self) -> &ChallengeStore {
        &self.store
    }

    /// Mints a new challenge on every call. Never fails past this boundary:
    /// a store error becomes an error log entry with no result.
    pub async fn issue(&self) -> Envelope<Challenge> {
        match self.store.issue().await {
            Ok(challenge) => {
                self.audit.challenge_issued(&challenge.id.to_string());
                Envelope::ok(challenge, Vec::new())
            }
            Err(e) => {
                error!(error = %e, "challenge issuance failed");
                Envelope::failure(LogEntry::error(CREATION_FAILED, e.to_string()).normalized())
            }
        }
    }

    /// Checks a `Challenge` header value and consumes the challenge.
    pub async fn verify_header(&self, header: Option<&str>) -> Result<Challenge, ChallengeError> {
        let presented = header.and_then(Challenge::from_header);
        let Some(presented) = presented else {
            self.audit.challenge_rejected(None, "malformed");
            return Err(ChallengeError::Malformed);
        };

        let id = presented.id.to_string();
        match self.store.consume(&presented.id, &presented.val).await {
            Ok(challenge) => {
                self.audit.challenge_consumed(&id);
                Ok(challenge)
            }
            Err(e) => {
                debug!(challenge_id = %id, error = %e, "challenge rejected");
                self.audit.challenge_rejected(Some(&id), &e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::replay::ChallengeStatus;
    use crate::transport::LogLevel;

    #[tokio::test]
    async fn every_issue_is_a_new_retrievable_challenge() {
        let issuer = ChallengeIssuer::new(300, 16);
        let first = issuer.issue().await.result.unwrap();
        let second = issuer.issue().await.result.unwrap();

        assert_ne!(first.id, second.id);
        assert!(!first.val.is_empty());
        assert_eq!(issuer.store().get(&first.id).await, Some(first.clone()));
        assert_eq!(
            issuer.store().status(&first.id).await,
            Some(ChallengeStatus::Issued)
        );
    }

    #[tokio::test]
    async fn store_failure_becomes_error_log() {
        let issuer = ChallengeIssuer::new(300, 0);
        let envelope = issuer.issue().await;

        assert!(envelope.result.is_none());
        assert_eq!(envelope.logs.len(), 1);
        assert_eq!(envelope.logs[0].level, LogLevel::Error);
        assert_eq!(envelope.logs[0].title, CREATION_FAILED);
    }

    #[tokio::test]
    async fn header_verifies_once() {
        let issuer = ChallengeIssuer::new(300, 16);
        let challenge = issuer.issue().await.result.unwrap();
        let header = challenge.to_header();

        assert_eq!(issuer.verify_header(Some(&header)).await, Ok(challenge.clone()));
        assert_eq!(
            issuer.verify_header(Some(&header)).await,
            Err(ChallengeError::Consumed)
        );
        assert_eq!(
            issuer.store().status(&challenge.id).await,
            Some(ChallengeStatus::Consumed)
        );
    }

    #[tokio::test]
    async fn forged_or_missing_headers_are_rejected() {
        let issuer = ChallengeIssuer::new(300, 16);
        assert_eq!(issuer.verify_header(None).await, Err(ChallengeError::Malformed));
        assert_eq!(
            issuer.verify_header(Some("not base64!")).await,
            Err(ChallengeError::Malformed)
        );

        let mut forged = issuer.issue().await.result.unwrap();
        forged.val = "guess".into();
        assert_eq!(
            issuer.verify_header(Some(&forged.to_header())).await,
            Err(ChallengeError::Mismatch)
        );

        let unknown = Challenge {
            id: uuid::Uuid::new_v4(),
            ..forged
        };
        assert_eq!(
            issuer.verify_header(Some(&unknown.to_header())).await,
            Err(ChallengeError::Unknown)
        );
    }
}
