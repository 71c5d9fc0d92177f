//! Outbound request signing.
//!
//! Signatures are HMAC-SHA256 over the raw request body, rendered as a
//! comma-separated version list so endpoints can verify during key
//! rotation: `X-Signature: v1=<hex>,v2=<hex>`. `v1` is always the newest
//! secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the signature header value for a body under a rotating secret
/// list (newest first).
#[must_use]
pub fn signature_header(secrets: &[String], body: &[u8]) -> String {
    secrets
        .iter()
        .enumerate()
        .map(|(i, secret)| format!("v{}={}", i + 1, hex_signature(secret, body)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Hex HMAC-SHA256 of the body under one secret.
#[must_use]
pub fn hex_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a body against a signature header produced by
/// [`signature_header`] under any of the given secrets.
#[must_use]
pub fn verify(secrets: &[String], body: &[u8], header: &str) -> bool {
    header.split(',').any(|entry| {
        let Some((_, signature)) = entry.trim().split_once('=') else {
            return false;
        };
        secrets
            .iter()
            .any(|secret| constant_time_eq(signature.as_bytes(), hex_signature(secret, body).as_bytes()))
    })
}

/// Constant-time byte comparison.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
