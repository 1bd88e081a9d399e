//! Webhook signature verification
//!
//! Inbound notifications from the payment provider and the code-hosting
//! platform are HMAC-SHA256 gated. Comparison is constant-time. Circle has
//! shipped several signature header encodings over time, so verification
//! tries an explicit ordered list of decoding strategies.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

type HmacSha256 = Hmac<Sha256>;

/// Header encodings Circle has used historically, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    /// Raw lowercase/uppercase hex digest.
    Hex,
    /// Standard base64 digest.
    Base64,
    /// Comma-separated `key=value` list carrying a hex digest under `v1`.
    KeyValueList,
}

pub const CIRCLE_SIGNATURE_ENCODINGS: [SignatureEncoding; 3] = [
    SignatureEncoding::Hex,
    SignatureEncoding::Base64,
    SignatureEncoding::KeyValueList,
];

/// Decode a signature header under one encoding. Returns the raw digest
/// bytes, or None when the header does not fit the encoding.
pub fn decode_signature(encoding: SignatureEncoding, header: &str) -> Option<Vec<u8>> {
    let header = header.trim();
    match encoding {
        SignatureEncoding::Hex => hex::decode(header).ok(),
        SignatureEncoding::Base64 => BASE64.decode(header).ok(),
        SignatureEncoding::KeyValueList => header
            .split(',')
            .filter_map(|part| part.trim().split_once('='))
            .find(|(key, _)| *key == "v1")
            .and_then(|(_, value)| hex::decode(value).ok()),
    }
}

/// Constant-time HMAC-SHA256 check of `candidate` against `body`.
fn hmac_matches(secret: &[u8], body: &[u8], candidate: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(candidate).is_ok()
}

/// Verify a Circle webhook signature, accepting any historical encoding.
pub fn verify_circle_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    if body.is_empty() {
        return false;
    }

    CIRCLE_SIGNATURE_ENCODINGS.iter().any(|encoding| {
        decode_signature(*encoding, header)
            .is_some_and(|digest| hmac_matches(secret.as_bytes(), body, &digest))
    })
}

/// Verify a GitHub `X-Hub-Signature-256` header (`sha256=<hex>`).
pub fn verify_github_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(digest) = hex::decode(hex_digest) else {
        return false;
    };
    hmac_matches(secret.as_bytes(), body, &digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"transfer":{"id":"tr_1","status":"complete"}}"#;

    fn digest(secret: &str, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }

    #[test]
    fn test_hex_encoding_accepted() {
        let header = hex::encode(digest(SECRET, BODY));
        assert!(verify_circle_signature(SECRET, BODY, Some(&header)));
    }

    #[test]
    fn test_base64_encoding_accepted() {
        let header = BASE64.encode(digest(SECRET, BODY));
        assert!(verify_circle_signature(SECRET, BODY, Some(&header)));
    }

    #[test]
    fn test_key_value_list_encoding_accepted() {
        let header = format!("t=1712345678,v1={}", hex::encode(digest(SECRET, BODY)));
        assert!(verify_circle_signature(SECRET, BODY, Some(&header)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = hex::encode(digest("other_secret", BODY));
        assert!(!verify_circle_signature(SECRET, BODY, Some(&header)));
    }

    #[test]
    fn test_missing_or_garbage_header_rejected() {
        assert!(!verify_circle_signature(SECRET, BODY, None));
        assert!(!verify_circle_signature(SECRET, BODY, Some("")));
        assert!(!verify_circle_signature(SECRET, BODY, Some("not-a-signature!")));
    }

    #[test]
    fn test_empty_body_rejected() {
        let header = hex::encode(digest(SECRET, b""));
        assert!(!verify_circle_signature(SECRET, b"", Some(&header)));
    }

    #[test]
    fn test_decode_strategies_independent() {
        let raw = digest(SECRET, BODY);
        let hex_header = hex::encode(&raw);
        let b64_header = BASE64.encode(&raw);
        let kv_header = format!("v1={hex_header}");

        assert_eq!(decode_signature(SignatureEncoding::Hex, &hex_header), Some(raw.clone()));
        assert_eq!(decode_signature(SignatureEncoding::Base64, &b64_header), Some(raw.clone()));
        assert_eq!(decode_signature(SignatureEncoding::KeyValueList, &kv_header), Some(raw));

        assert_eq!(decode_signature(SignatureEncoding::Hex, &kv_header), None);
        assert_eq!(decode_signature(SignatureEncoding::KeyValueList, &hex_header), None);
    }

    #[test]
    fn test_github_signature() {
        let header = format!("sha256={}", hex::encode(digest(SECRET, BODY)));
        assert!(verify_github_signature(SECRET, BODY, Some(&header)));

        // bare hex without the scheme prefix is rejected
        let bare = hex::encode(digest(SECRET, BODY));
        assert!(!verify_github_signature(SECRET, BODY, Some(&bare)));
        assert!(!verify_github_signature(SECRET, BODY, None));
    }
}
