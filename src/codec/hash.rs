//! HMAC-SHA256 body signing, base64url-encoded. Header name is fixed at
//! `HashSHA256` on both the request and response side.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Canonical header carrying the HMAC signature.
pub const HEADER_HASH: &str = "HashSHA256";

type HmacSha256 = Hmac<Sha256>;

/// Computes a base64url-encoded HMAC-SHA256 of `body` keyed by `key`.
pub fn hmac_sha256_base64url(key: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    URL_SAFE.encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of an incoming header value against the
/// HMAC computed over the raw body.
pub fn verify(key: &str, body: &[u8], header_value: &str) -> bool {
    let expected = hmac_sha256_base64url(key, body);
    expected.as_bytes().ct_eq(header_value.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_hash() {
        let h = hmac_sha256_base64url("secret", b"payload");
        assert!(verify("secret", b"payload", &h));
    }

    #[test]
    fn verify_rejects_bit_flip_in_body() {
        let h = hmac_sha256_base64url("secret", b"payload");
        assert!(!verify("secret", b"payloaD", &h));
    }

    #[test]
    fn verify_rejects_bit_flip_in_header() {
        let mut h = hmac_sha256_base64url("secret", b"payload");
        h.push('x');
        assert!(!verify("secret", b"payload", &h));
    }
}
