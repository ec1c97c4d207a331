//! OAuth client credentials per provider.
//!
//! Client ids and secrets are deployment secrets: they come from
//! `BROKER_OAUTH_{PROVIDER}_CLIENT_ID` / `_CLIENT_SECRET`, never from descriptors.

use std::collections::HashMap;
use std::fmt;

#[derive(Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Source of client credentials: the process environment, or a fixed table.
pub enum OAuthClients {
    Env,
    Fixed(HashMap<String, OAuthClient>),
}

impl OAuthClients {
    pub fn from_env() -> Self {
        OAuthClients::Env
    }

    pub fn fixed(clients: HashMap<String, OAuthClient>) -> Self {
        OAuthClients::Fixed(clients)
    }

    pub fn get(&self, provider: &str) -> Option<OAuthClient> {
        match self {
            OAuthClients::Env => {
                let prefix = env_prefix(provider);
                let client_id =
                    std::env::var(format!("BROKER_OAUTH_{}_CLIENT_ID", prefix)).ok()?;
                let client_secret =
                    std::env::var(format!("BROKER_OAUTH_{}_CLIENT_SECRET", prefix)).ok()?;
                Some(OAuthClient {
                    client_id,
                    client_secret,
                })
            }
            OAuthClients::Fixed(clients) => clients.get(provider).cloned(),
        }
    }
}

/// `shop-ify` → `SHOP_IFY`
fn env_prefix(provider: &str) -> String {
    provider.to_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix("shipbob"), "SHIPBOB");
        assert_eq!(env_prefix("quick-books"), "QUICK_BOOKS");
    }

    #[test]
    fn test_env_lookup() {
        std::env::set_var("BROKER_OAUTH_ENVTEST_PROVIDER_CLIENT_ID", "cid");
        std::env::set_var("BROKER_OAUTH_ENVTEST_PROVIDER_CLIENT_SECRET", "csecret");

        let client = OAuthClients::from_env()
            .get("envtest-provider")
            .expect("client from env");
        assert_eq!(client.client_id, "cid");
        assert_eq!(client.client_secret, "csecret");
        assert!(!format!("{:?}", client).contains("csecret"));

        assert!(OAuthClients::from_env().get("envtest-missing").is_none());
    }

    #[test]
    fn test_fixed_lookup() {
        let mut map = HashMap::new();
        map.insert(
            "shipbob".to_string(),
            OAuthClient {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
        );
        let clients = OAuthClients::fixed(map);
        assert!(clients.get("shipbob").is_some());
        assert!(clients.get("printful").is_none());
    }
}
