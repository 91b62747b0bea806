use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

pub const SYSTEM_URL_ENV: &str = "REQUEST_AUTH_SYSTEM_URL";
pub const KEYFILE_ENV: &str = "REQUEST_AUTH_KEYFILE";

fn default_keyfile() -> String {
    "agent.json".to_string()
}
fn default_bearer_wait() -> u64 {
    30
}
fn default_bearer_skew() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    10
}
fn default_challenge_ttl() -> u64 {
    300
}
fn default_challenge_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// System-description endpoint fetched at startup.
    pub system_url: Option<String>,
    #[serde(default = "default_keyfile")]
    pub keyfile: String,
    /// Upper bound on waiting for a bearer refresh.
    #[serde(default = "default_bearer_wait")]
    pub bearer_wait_secs: u64,
    /// Tokens expiring within this margin are refreshed early.
    #[serde(default = "default_bearer_skew")]
    pub bearer_skew_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
    #[serde(default = "default_challenge_capacity")]
    pub challenge_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_url: None,
            keyfile: default_keyfile(),
            bearer_wait_secs: default_bearer_wait(),
            bearer_skew_secs: default_bearer_skew(),
            request_timeout_secs: default_request_timeout(),
            challenge_ttl_secs: default_challenge_ttl(),
            challenge_capacity: default_challenge_capacity(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        Ok(cfg.with_env())
    }

    /// Applies `REQUEST_AUTH_*` overrides.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var(SYSTEM_URL_ENV) {
            self.system_url = Some(url);
        }
        if let Ok(keyfile) = std::env::var(KEYFILE_ENV) {
            self.keyfile = keyfile;
        }
        self
    }
}
