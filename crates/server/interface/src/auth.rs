//! Webhook and admin authentication helpers.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time comparison of a provided header secret against the
/// configured one. Absent or empty secrets never match.
pub fn secret_token_matches(provided: Option<&str>, expected: &str) -> bool {
    let Some(provided) = provided else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify the voice provider's HMAC-SHA256 signature over
/// `{timestamp}.{body}`, hex-encoded in the signature header.
pub fn verify_voice_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Produce the signature a voice webhook sender would attach. Test helper
/// and documentation of the scheme in one place.
pub fn sign_voice_payload(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_token_requires_exact_match() {
        assert!(secret_token_matches(Some("s3cret"), "s3cret"));
        assert!(!secret_token_matches(Some("s3cret!"), "s3cret"));
        assert!(!secret_token_matches(Some("S3CRET"), "s3cret"));
        assert!(!secret_token_matches(None, "s3cret"));
        assert!(!secret_token_matches(Some(""), ""));
    }

    #[test]
    fn voice_signature_round_trip() {
        let secret = "whsec_test";
        let body = br#"{"data":{"id":"evt_1"}}"#;
        let timestamp = "1700000000";

        let signature = sign_voice_payload(secret, timestamp, body);
        assert!(verify_voice_signature(secret, timestamp, body, &signature));
        assert!(!verify_voice_signature(secret, "1700000001", body, &signature));
        assert!(!verify_voice_signature("wrong", timestamp, body, &signature));
        assert!(!verify_voice_signature(secret, timestamp, b"tampered", &signature));
        assert!(!verify_voice_signature(secret, timestamp, body, "zz-not-hex"));
    }
}
