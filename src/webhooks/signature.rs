//! HMAC-SHA256 signing for webhook bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a signature header against `body`.
///
/// The header is the hex digest, optionally prefixed with `sha256=`. The
/// comparison is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let digest = header.trim();
    let digest = digest.strip_prefix("sha256=").unwrap_or(digest);
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
