use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

// Ed25519(payload, agent private key) → Signature header (base64)

pub const SIGNATURE_HEADER: &str = "signature";

pub fn compute_signature_base64(key: &SigningKey, payload: &[u8]) -> String {
    let sig = key.sign(payload);
    general_purpose::STANDARD.encode(sig.to_bytes())
}

fn decode_signature(sig: &str) -> Result<Signature> {
    let bytes = general_purpose::STANDARD
        .decode(sig.trim())
        .map_err(|_| anyhow!("invalid signature encoding"))?;
    Signature::from_slice(&bytes).map_err(|_| anyhow!("invalid signature length"))
}

pub fn verify_signature(key: &VerifyingKey, payload: &[u8], sig: &str) -> Result<()> {
    let signature = decode_signature(sig)?;
    key.verify(payload, &signature)
        .map_err(|_| anyhow!("signature mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn signature_verifies_against_exact_payload() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = compute_signature_base64(&key, br#"{"handle":"newbie"}"#);

        assert!(verify_signature(&key.verifying_key(), br#"{"handle":"newbie"}"#, &sig).is_ok());
        assert!(verify_signature(&key.verifying_key(), br#"{"handle":"newbie" }"#, &sig).is_err());
    }

    #[test]
    fn signature_from_other_key_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let sig = compute_signature_base64(&key, b"http://localhost/api/sys/system");

        let err = verify_signature(&other.verifying_key(), b"http://localhost/api/sys/system", &sig)
            .unwrap_err();
        assert_eq!(err.to_string(), "signature mismatch");
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        assert!(verify_signature(&key.verifying_key(), b"x", "%%%").is_err());
        assert!(verify_signature(&key.verifying_key(), b"x", "AAAA").is_err());
    }
}
