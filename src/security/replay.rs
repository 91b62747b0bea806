use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine};
use chrono::Utc;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::transport::Challenge;

/// `Issued` moves to exactly one of the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Issued,
    Consumed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeError {
    #[error("challenge store is full ({0} outstanding)")]
    Capacity(usize),
    #[error("malformed challenge")]
    Malformed,
    #[error("unknown challenge")]
    Unknown,
    #[error("challenge value mismatch")]
    Mismatch,
    #[error("challenge already consumed")]
    Consumed,
    #[error("challenge expired")]
    Expired,
}

#[derive(Debug, Clone)]
struct Entry {
    challenge: Challenge,
    status: ChallengeStatus,
}

/// Server-side table of minted challenges.
#[derive(Debug, Clone)]
pub struct ChallengeStore {
    ttl: chrono::Duration,
    capacity: usize,
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

fn random_value() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl ChallengeStore {
    pub fn new(ttl_secs: u64, capacity: usize) -> Self {
        // chrono caps durations at i64::MAX milliseconds
        let ttl_secs = ttl_secs.min(i64::MAX as u64 / 1000) as i64;
        Self {
            ttl: chrono::Duration::seconds(ttl_secs),
            capacity,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // Expire lapsed entries; drop terminal ones a full ttl past expiry.
    fn sweep(map: &mut HashMap<Uuid, Entry>, now_ms: i64, ttl_ms: i64) {
        for entry in map.values_mut() {
            if entry.status == ChallengeStatus::Issued && entry.challenge.exp <= now_ms {
                entry.status = ChallengeStatus::Expired;
            }
        }
        map.retain(|_, e| {
            e.status == ChallengeStatus::Issued || e.challenge.exp.saturating_add(ttl_ms) > now_ms
        });
    }

    pub async fn issue(&self) -> Result<Challenge, ChallengeError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut map = self.inner.lock().await;
        Self::sweep(&mut map, now_ms, self.ttl.num_milliseconds());

        let outstanding = map
            .values()
            .filter(|e| e.status == ChallengeStatus::Issued)
            .count();
        if outstanding >= self.capacity {
            return Err(ChallengeError::Capacity(outstanding));
        }

        let challenge = Challenge {
            id: Uuid::new_v4(),
            val: random_value(),
            exp: now_ms.saturating_add(self.ttl.num_milliseconds()),
        };
        map.insert(
            challenge.id,
            Entry {
                challenge: challenge.clone(),
                status: ChallengeStatus::Issued,
            },
        );
        Ok(challenge)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Challenge> {
        self.inner.lock().await.get(id).map(|e| e.challenge.clone())
    }

    pub async fn status(&self, id: &Uuid) -> Option<ChallengeStatus> {
        let now_ms = Utc::now().timestamp_millis();
        let map = self.inner.lock().await;
        map.get(id).map(|e| match e.status {
            ChallengeStatus::Issued if e.challenge.exp <= now_ms => ChallengeStatus::Expired,
            status => status,
        })
    }

    /// Validates `val` for `id` once. Any later presentation is rejected.
    pub async fn consume(&self, id: &Uuid, val: &str) -> Result<Challenge, ChallengeError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut map = self.inner.lock().await;
        let entry = map.get_mut(id).ok_or(ChallengeError::Unknown)?;

        if entry.status == ChallengeStatus::Issued && entry.challenge.exp <= now_ms {
            entry.status = ChallengeStatus::Expired;
        }

        match entry.status {
            ChallengeStatus::Consumed => Err(ChallengeError::Consumed),
            ChallengeStatus::Expired => Err(ChallengeError::Expired),
            ChallengeStatus::Issued => {
                if val.as_bytes().ct_eq(entry.challenge.val.as_bytes()).unwrap_u8() != 1 {
                    return Err(ChallengeError::Mismatch);
                }
                entry.status = ChallengeStatus::Consumed;
                Ok(entry.challenge.clone())
            }
        }
    }

    pub async fn outstanding(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        self.inner
            .lock()
            .await
            .values()
            .filter(|e| e.status == ChallengeStatus::Issued && e.challenge.exp > now_ms)
            .count()
    }
}
