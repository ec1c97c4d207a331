//! Credential vault: encryption-at-rest for every secret the broker persists.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialVault                    │
//! │  - seal / open single values             │
//! │  - seal / open credential bundles        │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM                           │
//! │  - Random nonce embedded per value       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The vault is built once at startup from `BROKER_ENCRYPTION_KEY` and passed
//! by `Arc` to the components that need it.
//!
//! # Usage
//!
//! ```no_run
//! use broker::vault::CredentialVault;
//!
//! # fn main() -> anyhow::Result<()> {
//! let vault = CredentialVault::new(&std::env::var("BROKER_ENCRYPTION_KEY")?)?;
//! let sealed = vault.encrypt("sk_live_123")?;
//! assert_eq!(vault.decrypt(&sealed)?, "sk_live_123");
//! # Ok(())
//! # }
//! ```

mod encryption;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use encryption::{validate_key, KEY_SIZE};

/// Decryption failures. Never carries any part of the input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptionError {
    #[error("ciphertext is not a recognised vault envelope")]
    UnknownFormat,
    #[error("ciphertext is malformed")]
    Malformed,
    /// Wrong key, or the envelope was tampered with.
    #[error("ciphertext failed authentication")]
    Authentication,
}

/// A vault-encrypted value. Only [`CredentialVault::decrypt`] turns it back into plaintext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sealed(String);

impl Sealed {
    /// Wraps a value read back from storage.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sealed(..)")
    }
}

/// Decrypted credential fields. `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PlainCredentials(BTreeMap<String, String>);

impl PlainCredentials {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// Symmetric encryption keyed by the process-wide master key.
pub struct CredentialVault {
    key: Vec<u8>,
}

impl CredentialVault {
    /// Builds the vault from a base64-encoded 32-byte master key.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = validate_key(key_base64).context("Invalid vault master key")?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Sealed> {
        encryption::seal(plaintext, &self.key).map(Sealed)
    }

    pub fn decrypt(&self, sealed: &Sealed) -> Result<String, DecryptionError> {
        encryption::open(&sealed.0, &self.key)
    }

    /// Seals every field of a credential bundle.
    pub fn seal_all(&self, plain: &PlainCredentials) -> Result<BTreeMap<String, Sealed>> {
        plain
            .0
            .iter()
            .map(|(field, value)| {
                let sealed = self
                    .encrypt(value)
                    .with_context(|| format!("Failed to encrypt credential field '{}'", field))?;
                Ok((field.clone(), sealed))
            })
            .collect()
    }

    /// Opens every field of a sealed bundle; any failure aborts the whole bundle.
    pub fn open_all(
        &self,
        sealed: &BTreeMap<String, Sealed>,
    ) -> Result<PlainCredentials, DecryptionError> {
        let mut fields = BTreeMap::new();
        for (field, value) in sealed {
            fields.insert(field.clone(), self.decrypt(value)?);
        }
        Ok(PlainCredentials(fields))
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}
