use tracing::{info, warn};

/// Security events, emitted on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn bearer_refreshed(&self, bearer_id: &str, credential_id: &str) {
        info!(target: "audit", event = "bearer_refreshed", bearer_id, credential_id);
    }

    pub fn bearer_refresh_failed(&self, bearer_id: &str, reason: &str) {
        warn!(target: "audit", event = "bearer_refresh_failed", bearer_id, reason);
    }

    pub fn signature_attached(&self, credential_id: &str, operation: &str) {
        info!(target: "audit", event = "signature_attached", credential_id, operation);
    }

    pub fn challenge_issued(&self, challenge_id: &str) {
        info!(target: "audit", event = "challenge_issued", challenge_id);
    }

    pub fn challenge_consumed(&self, challenge_id: &str) {
        info!(target: "audit", event = "challenge_consumed", challenge_id);
    }

    pub fn challenge_rejected(&self, challenge_id: Option<&str>, reason: &str) {
        warn!(target: "audit", event = "challenge_rejected", challenge_id = challenge_id.unwrap_or(""), reason);
    }
}
