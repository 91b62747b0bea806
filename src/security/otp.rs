use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const OTP_HEADER: &str = "otp";

fn default_digits() -> u32 {
    6
}

fn default_period() -> u64 {
    30
}

/// Locally held one-time-password seed.
///
/// With a `counter` the code is HOTP (RFC 4226); without one it is TOTP
/// over `period`-second steps (RFC 6238).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpSeed {
    /// Base64 shared secret.
    pub secret: String,
    #[serde(default)]
    pub counter: Option<u64>,
    #[serde(default = "default_digits")]
    pub digits: u32,
    #[serde(default = "default_period")]
    pub period: u64,
}

impl std::fmt::Debug for OtpSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpSeed")
            .field("secret", &"<redacted>")
            .field("counter", &self.counter)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .finish()
    }
}

impl OtpSeed {
    pub fn totp(secret: &[u8]) -> Self {
        Self {
            secret: general_purpose::STANDARD.encode(secret),
            counter: None,
            digits: default_digits(),
            period: default_period(),
        }
    }

    pub fn hotp(secret: &[u8], counter: u64) -> Self {
        Self {
            counter: Some(counter),
            ..Self::totp(secret)
        }
    }

    pub fn code_at(&self, unix_secs: i64) -> Result<String> {
        if !(1..=9).contains(&self.digits) {
            return Err(anyhow!("unsupported otp length {}", self.digits));
        }
        let secret = general_purpose::STANDARD
            .decode(&self.secret)
            .context("decoding otp secret")?;
        let moving_factor = match self.counter {
            Some(counter) => counter,
            None => {
                if self.period == 0 {
                    return Err(anyhow!("otp period must be positive"));
                }
                unix_secs.max(0) as u64 / self.period
            }
        };
        Ok(hotp(&secret, moving_factor, self.digits))
    }

    pub fn current_code(&self) -> Result<String> {
        self.code_at(Utc::now().timestamp())
    }
}

pub fn hotp(secret: &[u8], counter: u64, digits: u32) -> String {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // dynamic truncation
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let code = binary % 10u32.pow(digits);
    format!("{:0width$}", code, width = digits as usize)
}
