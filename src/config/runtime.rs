use super::BrokerConfig;
use anyhow::{Context, Result};

/// Settings that only ever come from the process environment.
///
/// Secrets never live in the config file: the vault master key and the
/// per-provider OAuth client credentials are read here (the latter lazily, by
/// [`crate::oauth::OAuthClients`]).
pub struct RuntimeEnv {
    /// Base64-encoded 32-byte vault key (`BROKER_ENCRYPTION_KEY`).
    pub encryption_key: String,
    /// `BROKER_PUBLIC_URL`, overriding `server.public_base_url`.
    pub public_url: Option<String>,
}

impl RuntimeEnv {
    /// Build from env vars. The encryption key is required.
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("BROKER_ENCRYPTION_KEY")
            .context("BROKER_ENCRYPTION_KEY must be set (base64-encoded 32-byte key)")?;

        let public_url = std::env::var("BROKER_PUBLIC_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            encryption_key,
            public_url,
        })
    }

    /// Applies environment overrides onto the file config.
    pub fn apply(&self, config: &mut BrokerConfig) {
        if let Some(url) = &self.public_url {
            config.server.public_base_url = url.clone();
        }
    }
}

impl std::fmt::Debug for RuntimeEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEnv")
            .field("encryption_key", &"<redacted>")
            .field("public_url", &self.public_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overrides_public_url() {
        let env = RuntimeEnv {
            encryption_key: "k".into(),
            public_url: Some("https://broker.example.com".into()),
        };
        let mut config = BrokerConfig::default();
        env.apply(&mut config);
        assert_eq!(config.server.public_base_url, "https://broker.example.com");
    }

    #[test]
    fn test_debug_redacts_key() {
        let env = RuntimeEnv {
            encryption_key: "super-secret".into(),
            public_url: None,
        };
        assert!(!format!("{:?}", env).contains("super-secret"));
    }
}
