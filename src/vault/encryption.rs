//! AES-256-GCM primitives behind the credential vault.
//!
//! Each value is encrypted with a fresh random nonce. The output is
//! `v1:` followed by base64(`nonce || ciphertext+tag`) so decryption only
//! needs the key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::DecryptionError;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Version tag prefixed to every sealed value.
const FORMAT_PREFIX: &str = "v1:";

/// Validates that the master key is exactly 32 bytes when base64 decoded.
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Encrypts plaintext with a random nonce and returns the self-describing envelope.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<String> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut envelope = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", FORMAT_PREFIX, BASE64.encode(envelope)))
}

/// Decrypts an envelope produced by [`seal`].
///
/// Fails on a wrong key, a truncated or tampered envelope, or an unknown format.
pub fn open(sealed: &str, key: &[u8]) -> Result<String, DecryptionError> {
    let encoded = sealed
        .strip_prefix(FORMAT_PREFIX)
        .ok_or(DecryptionError::UnknownFormat)?;

    let envelope = BASE64
        .decode(encoded)
        .map_err(|_| DecryptionError::Malformed)?;

    // GCM tag is 16 bytes; anything shorter than nonce + tag cannot be valid
    if envelope.len() < NONCE_SIZE + 16 {
        return Err(DecryptionError::Malformed);
    }

    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| DecryptionError::Authentication)?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| DecryptionError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| DecryptionError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());

        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_envelope_carries_nonce() {
        let key = [7u8; 32];
        let sealed = seal("shpat_123", &key).unwrap();
        assert!(sealed.starts_with("v1:"));

        let raw = BASE64.decode(&sealed[3..]).unwrap();
        // nonce + plaintext + 16-byte tag
        assert_eq!(raw.len(), NONCE_SIZE + "shpat_123".len() + 16);
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        let key = [0u8; 32];
        assert_eq!(open("plaintext", &key), Err(DecryptionError::UnknownFormat));
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let key = [0u8; 32];
        let short = format!("v1:{}", BASE64.encode([1u8; 10]));
        assert_eq!(open(&short, &key), Err(DecryptionError::Malformed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0u8; 32];
        let sealed = seal("secret", &key).unwrap();

        let mut raw = BASE64.decode(&sealed[3..]).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("v1:{}", BASE64.encode(raw));

        assert_eq!(open(&tampered, &key), Err(DecryptionError::Authentication));
    }
}
