//! Seller integration records.
//!
//! One record exists per (seller, provider, environment). Records are never
//! deleted: disconnecting scrubs credentials and flips the status, keeping the
//! history for audit.

mod store;

pub use store::IntegrationStore;

use crate::vault::Sealed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sandbox and live connections never share state or credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Live => "live",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(Environment::Sandbox),
            "live" => Ok(Environment::Live),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// The ownership tuple of a [`SellerIntegration`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntegrationKey {
    pub seller_id: String,
    pub provider: String,
    pub environment: Environment,
}

impl IntegrationKey {
    pub fn new(
        seller_id: impl Into<String>,
        provider: impl Into<String>,
        environment: Environment,
    ) -> Self {
        Self {
            seller_id: seller_id.into(),
            provider: provider.into(),
            environment,
        }
    }
}

impl fmt::Display for IntegrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.seller_id, self.provider, self.environment)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConnectionStatus::Pending),
            "connected" => Some(ConnectionStatus::Connected),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

/// Sealed OAuth token metadata for `oauth2` providers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: Sealed,
    pub refresh_token: Option<Sealed>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Optional webhook sub-configuration of an integration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: String,
    pub secret: Sealed,
}

/// One entry of the append-only status history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// A seller's connection to one provider in one environment.
#[derive(Clone, Debug)]
pub struct SellerIntegration {
    pub id: String,
    pub seller_id: String,
    pub provider: String,
    pub environment: Environment,
    pub status: ConnectionStatus,
    /// Field name → sealed value.
    pub credentials: BTreeMap<String, Sealed>,
    pub tokens: Option<OAuthTokens>,
    pub webhook: Option<WebhookSettings>,
    pub last_error: Option<String>,
    /// Loaded on read; appended through the store, never rewritten.
    pub history: Vec<HistoryEntry>,
    /// Bumped on every write; used for compare-and-swap updates.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SellerIntegration {
    /// A fresh, not-yet-persisted record.
    pub fn new(key: &IntegrationKey, status: ConnectionStatus) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            seller_id: key.seller_id.clone(),
            provider: key.provider.clone(),
            environment: key.environment,
            status,
            credentials: BTreeMap::new(),
            tokens: None,
            webhook: None,
            last_error: None,
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> IntegrationKey {
        IntegrationKey::new(&self.seller_id, &self.provider, self.environment)
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Removes every secret from the record.
    pub fn scrub(&mut self) {
        self.credentials.clear();
        self.tokens = None;
        self.webhook = None;
    }
}

/// Public view of an integration; never carries credentials.
#[derive(Clone, Debug, Serialize)]
pub struct IntegrationSummary {
    pub id: String,
    pub provider: String,
    pub environment: Environment,
    pub status: ConnectionStatus,
    pub credential_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    pub webhook_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SellerIntegration> for IntegrationSummary {
    fn from(integration: &SellerIntegration) -> Self {
        Self {
            id: integration.id.clone(),
            provider: integration.provider.clone(),
            environment: integration.environment,
            status: integration.status,
            credential_fields: integration.credentials.keys().cloned().collect(),
            token_expires_at: integration.tokens.as_ref().and_then(|t| t.expires_at),
            webhook_enabled: integration
                .webhook
                .as_ref()
                .map(|w| w.enabled)
                .unwrap_or(false),
            last_error: integration.last_error.clone(),
            history: integration.history.clone(),
            updated_at: integration.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse_and_display() {
        assert_eq!("sandbox".parse::<Environment>(), Ok(Environment::Sandbox));
        assert_eq!("live".parse::<Environment>(), Ok(Environment::Live));
        assert!("prod".parse::<Environment>().is_err());
        assert_eq!(Environment::Live.to_string(), "live");
    }

    #[test]
    fn test_scrub_removes_secrets() {
        let key = IntegrationKey::new("s1", "shipbob", Environment::Sandbox);
        let mut integration = SellerIntegration::new(&key, ConnectionStatus::Connected);
        integration
            .credentials
            .insert("api_key".into(), Sealed::from_stored("v1:abc".into()));
        integration.tokens = Some(OAuthTokens {
            access_token: Sealed::from_stored("v1:tok".into()),
            refresh_token: None,
            expires_at: None,
        });

        integration.scrub();
        assert!(integration.credentials.is_empty());
        assert!(integration.tokens.is_none());
        assert!(integration.webhook.is_none());
    }

    #[test]
    fn test_summary_lists_field_names_only() {
        let key = IntegrationKey::new("s1", "printful", Environment::Live);
        let mut integration = SellerIntegration::new(&key, ConnectionStatus::Connected);
        integration
            .credentials
            .insert("api_key".into(), Sealed::from_stored("v1:secret".into()));

        let json = serde_json::to_string(&IntegrationSummary::from(&integration)).unwrap();
        assert!(json.contains("\"credential_fields\":[\"api_key\"]"));
        assert!(!json.contains("v1:secret"));
    }
}
