use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the request signature: base64(HMAC-SHA256(secret, token ‖ requestTime)).
///
/// The body is deliberately not part of the signed quantity; the bounded
/// request-time window provides replay protection instead.
pub fn request_signature(secret: &str, token: &str, request_time: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    mac.update(request_time.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a signature produced by [`request_signature`] in constant time.
pub fn verify_signature(secret: &str, token: &str, request_time: &str, signature: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    mac.update(request_time.as_bytes());
    mac.verify_slice(&raw).is_ok()
}

/// Generate a random 128-bit identifier rendered as 32 hex characters.
///
/// Used for request tokens, message and deployment ids, and key secrets.
pub fn new_identifier() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::{new_identifier, request_signature, verify_signature};

    #[test]
    fn sign_verify_round_trip() {
        let token = new_identifier();
        let sig = request_signature("sekrit", &token, "2026-03-01T12:00:00Z");
        assert!(verify_signature("sekrit", &token, "2026-03-01T12:00:00Z", &sig));
    }

    #[test]
    fn rejects_tampering() {
        let sig = request_signature("sekrit", "aaaa", "2026-03-01T12:00:00Z");
        assert!(!verify_signature("sekrit", "bbbb", "2026-03-01T12:00:00Z", &sig));
        assert!(!verify_signature("sekrit", "aaaa", "2026-03-01T12:00:01Z", &sig));
        assert!(!verify_signature("other", "aaaa", "2026-03-01T12:00:00Z", &sig));
        assert!(!verify_signature("sekrit", "aaaa", "2026-03-01T12:00:00Z", "not base64!"));
    }

    #[test]
    fn identifiers_are_32_hex_chars() {
        let id = new_identifier();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_identifier());
    }
}
