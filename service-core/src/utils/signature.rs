//! Management API request signing.
//!
//! A request is signed over the newline-joined string
//! `METHOD\nBodyMD5\nContentType\nDate\nExpires\nHost` with HMAC-SHA256. The
//! MAC is base64-encoded and then URL-escaped before it travels in the
//! `Digest: sha-256=<sig>` header.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const DIGEST_PREFIX: &str = "sha-256=";

/// The header values covered by a signature.
#[derive(Debug, Clone, Default)]
pub struct SignedParts<'a> {
    pub method: &'a str,
    pub body_md5: &'a str,
    pub content_type: &'a str,
    pub date: &'a str,
    pub expires: &'a str,
    pub host: &'a str,
}

impl SignedParts<'_> {
    pub fn string_to_sign(&self) -> String {
        [
            self.method.to_ascii_uppercase().as_str(),
            self.body_md5,
            self.content_type,
            self.date,
            self.expires,
            self.host,
        ]
        .join("\n")
    }
}

/// Base64 MD5 of the request body, as carried in `Content-MD5`.
pub fn body_md5(body: &[u8]) -> String {
    STANDARD.encode(Md5::digest(body))
}

/// Sign the parts; returns the URL-escaped base64 MAC.
pub fn generate_signature(secret: &[u8], parts: &SignedParts<'_>) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(parts.string_to_sign().as_bytes());
    let encoded = STANDARD.encode(mac.finalize().into_bytes());

    Ok(urlencoding::encode(&encoded).into_owned())
}

/// Constant-time verification of a URL-escaped signature.
pub fn verify_signature(
    secret: &[u8],
    parts: &SignedParts<'_>,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = generate_signature(secret, parts)?;

    if expected.len() != signature.len() {
        return Ok(false);
    }

    Ok(expected.as_bytes().ct_eq(signature.as_bytes()).into())
}

/// Value for the `Digest` header.
pub fn digest_header(signature: &str) -> String {
    format!("{}{}", DIGEST_PREFIX, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(body_md5: &'a str) -> SignedParts<'a> {
        SignedParts {
            method: "POST",
            body_md5,
            content_type: "application/json",
            date: "Mon, 19 Oct 2026 10:00:00 +0000",
            expires: "Mon, 19 Oct 2026 10:05:00 +0000",
            host: "id.example.com",
        }
    }

    #[test]
    fn test_string_to_sign_layout() {
        let p = SignedParts {
            method: "post",
            ..parts("bWQ1")
        };
        assert_eq!(
            p.string_to_sign(),
            "POST\nbWQ1\napplication/json\n\
             Mon, 19 Oct 2026 10:00:00 +0000\n\
             Mon, 19 Oct 2026 10:05:00 +0000\n\
             id.example.com"
        );
    }

    #[test]
    fn test_body_md5_known_value() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(body_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn test_signature_is_url_escaped() {
        let md5 = body_md5(br#"{"email":"a@b.c"}"#);
        let signature = generate_signature(b"secret", &parts(&md5)).unwrap();
        assert!(!signature.contains('+'));
        assert!(!signature.contains('/'));
        assert!(!signature.contains('='));
    }

    #[test]
    fn test_signature_round_trip_and_tamper() {
        let md5 = body_md5(br#"{"email":"a@b.c"}"#);
        let signature = generate_signature(b"secret", &parts(&md5)).unwrap();

        assert!(verify_signature(b"secret", &parts(&md5), &signature).unwrap());
        assert!(!verify_signature(b"other", &parts(&md5), &signature).unwrap());

        let tampered = body_md5(br#"{"email":"x@b.c"}"#);
        assert!(!verify_signature(b"secret", &parts(&tampered), &signature).unwrap());
    }
}
