//! Connection lifecycle for seller integrations.
//!
//! ```text
//! disconnected → authorizing → connected → (refreshing ⇄ connected) → disconnected | error
//! ```
//!
//! `authorizing` only exists as a live [`OAuthState`]; the integration record
//! is written when the callback succeeds (or on a direct credential connect).
//! Token refreshes go through a versioned compare-and-swap so two concurrent
//! refreshes never write stale tokens over fresh ones.

mod clients;
mod exchange;
mod state_store;

pub use clients::{OAuthClient, OAuthClients};
pub use exchange::{build_authorize_url, TokenSet};
pub use state_store::{run_state_cleanup, OAuthState, OAuthStateStore};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::integration::{
    ConnectionStatus, Environment, HistoryEntry, IntegrationKey, IntegrationStore, OAuthTokens,
    SellerIntegration, WebhookSettings,
};
use crate::providers::{OAuthEndpoints, ProviderDescriptor, ProviderRegistry};
use crate::service::request;
use crate::vault::{CredentialVault, PlainCredentials};
use anyhow::{anyhow, Context};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at a read-modify-write before giving up on a contended record.
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Query parameters of a provider's redirect back to the callback route.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Result of writing a refresh outcome onto a possibly contended record.
enum RefreshWrite {
    Stored(SellerIntegration),
    /// Another writer replaced the tokens first
    Superseded(SellerIntegration),
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub public_base_url: String,
    pub refresh_margin_secs: u64,
    pub http_timeout_secs: u64,
}

impl OAuthSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            public_base_url: config.server.public_base_url.clone(),
            refresh_margin_secs: config.oauth.refresh_margin_secs,
            http_timeout_secs: config.oauth.http_timeout_secs,
        }
    }
}

/// Result of [`OAuthConnectionManager::configure_webhook`]. `secret` is only
/// set when a signing secret was generated by this call.
#[derive(Debug)]
pub struct WebhookConfigured {
    pub integration: SellerIntegration,
    pub secret: Option<String>,
}

pub struct OAuthConnectionManager {
    registry: Arc<ProviderRegistry>,
    vault: Arc<CredentialVault>,
    states: Arc<OAuthStateStore>,
    integrations: Arc<IntegrationStore>,
    clients: OAuthClients,
    http: reqwest::Client,
    public_base_url: String,
    refresh_margin: chrono::Duration,
}

impl OAuthConnectionManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        vault: Arc<CredentialVault>,
        states: Arc<OAuthStateStore>,
        integrations: Arc<IntegrationStore>,
        clients: OAuthClients,
        settings: OAuthSettings,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .user_agent(concat!("integration-broker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            registry,
            vault,
            states,
            integrations,
            clients,
            http,
            public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
            refresh_margin: chrono::Duration::seconds(settings.refresh_margin_secs as i64),
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn integrations(&self) -> &Arc<IntegrationStore> {
        &self.integrations
    }

    pub fn states(&self) -> &Arc<OAuthStateStore> {
        &self.states
    }

    /// Shared client carrying the provider-call timeout.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Callback URL registered with the provider; one per provider and environment.
    pub fn redirect_uri(&self, provider: &str, environment: Environment) -> String {
        format!(
            "{}/api/integrations/{}/{}/oauth/callback",
            self.public_base_url, provider, environment
        )
    }

    /// Starts the authorization-code flow and returns the provider URL to redirect to.
    pub fn begin_authorize(
        &self,
        seller_id: &str,
        provider: &str,
        environment: Environment,
    ) -> BrokerResult<String> {
        let (_, endpoints) = self.oauth_descriptor(provider)?;
        let client = self.client_for(provider)?;

        let state = self.states.issue(seller_id, provider, environment);
        let url = build_authorize_url(
            &endpoints,
            &client.client_id,
            &self.redirect_uri(provider, environment),
            &state,
        );

        info!(
            seller_id = %seller_id,
            provider = %provider,
            environment = %environment,
            "OAuth authorization started"
        );
        Ok(url)
    }

    /// Finalizes the flow: consumes the state, exchanges the code and stores the
    /// sealed tokens with the integration in `connected`.
    pub async fn handle_callback(
        &self,
        provider: &str,
        environment: Environment,
        params: &CallbackParams,
    ) -> BrokerResult<SellerIntegration> {
        let (_, endpoints) = self.oauth_descriptor(provider)?;

        let token = params.state.as_deref().ok_or(BrokerError::InvalidState)?;
        let state = self
            .states
            .consume(token, provider, environment)
            .ok_or(BrokerError::InvalidState)?;
        let key = IntegrationKey::new(&state.seller_id, provider, environment);

        if let Some(error) = &params.error {
            warn!(
                seller_id = %key.seller_id,
                provider = %provider,
                environment = %environment,
                error = %error,
                "Provider returned an OAuth error"
            );
            let detail = match &params.error_description {
                Some(d) => format!("{}: {}", error, d),
                None => error.clone(),
            };
            return Err(BrokerError::TokenExchangeFailed(format!(
                "authorization denied ({})",
                detail
            )));
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                BrokerError::TokenExchangeFailed("callback carries no authorization code".into())
            })?;

        let client = self.client_for(provider)?;
        let tokens = exchange::exchange_code(
            &self.http,
            &endpoints,
            &client,
            code,
            &self.redirect_uri(provider, environment),
        )
        .await
        .map_err(|e| {
            warn!(
                seller_id = %key.seller_id,
                provider = %provider,
                environment = %environment,
                error = %format!("{:#}", e),
                "OAuth token exchange failed"
            );
            BrokerError::TokenExchangeFailed(format!("{:#}", e))
        })?;

        let mut integration = self
            .integrations
            .get(&key)?
            .unwrap_or_else(|| SellerIntegration::new(&key, ConnectionStatus::Pending));
        integration.status = ConnectionStatus::Connected;
        integration.tokens = Some(self.seal_tokens(&tokens)?);
        integration.last_error = None;

        let stored = self
            .integrations
            .save(&integration, &HistoryEntry::now("connected", "authorized via OAuth"))?;

        info!(
            seller_id = %key.seller_id,
            provider = %provider,
            environment = %environment,
            integration_id = %stored.id,
            "Integration connected"
        );
        Ok(stored)
    }

    /// True when the access token expires within the refresh margin and a
    /// refresh token is available.
    pub fn needs_refresh(&self, integration: &SellerIntegration) -> bool {
        match &integration.tokens {
            Some(OAuthTokens {
                expires_at: Some(expires_at),
                refresh_token: Some(_),
                ..
            }) => *expires_at <= Utc::now() + self.refresh_margin,
            _ => false,
        }
    }

    /// Refreshes the access token once. A failed refresh flips the integration
    /// to `error` and surfaces `ReauthorizationRequired`: a dead refresh token
    /// cannot recover on its own.
    pub async fn refresh(&self, integration: &SellerIntegration) -> BrokerResult<SellerIntegration> {
        let (_, endpoints) = self.oauth_descriptor(&integration.provider)?;
        let client = self.client_for(&integration.provider)?;

        let sealed_refresh = integration
            .tokens
            .as_ref()
            .and_then(|t| t.refresh_token.as_ref());
        let refresh_token = match sealed_refresh {
            Some(sealed) => self.vault.decrypt(sealed)?,
            None => {
                return self
                    .fail_refresh(integration, "no refresh token available")
                    .await
            }
        };

        info!(
            seller_id = %integration.seller_id,
            provider = %integration.provider,
            environment = %integration.environment,
            integration_id = %integration.id,
            "Refreshing OAuth token"
        );

        let tokens =
            match exchange::refresh_tokens(&self.http, &endpoints, &client, &refresh_token).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    return self
                        .fail_refresh(integration, &format!("token refresh failed: {:#}", e))
                        .await
                }
            };

        let sealed = self.seal_tokens(&tokens)?;
        let outcome = self.write_refresh_outcome(
            integration,
            |record| {
                record.tokens = Some(sealed.clone());
                record.status = ConnectionStatus::Connected;
                record.last_error = None;
            },
            &HistoryEntry::now("token_refreshed", ""),
        )?;

        match outcome {
            RefreshWrite::Stored(stored) => {
                info!(
                    integration_id = %stored.id,
                    provider = %stored.provider,
                    "OAuth token refreshed successfully"
                );
                Ok(stored)
            }
            RefreshWrite::Superseded(current) => self.superseded(integration, current),
        }
    }

    /// Refreshes only if [`needs_refresh`](Self::needs_refresh) says so.
    pub async fn ensure_fresh(
        &self,
        integration: &SellerIntegration,
    ) -> BrokerResult<SellerIntegration> {
        if self.needs_refresh(integration) {
            self.refresh(integration).await
        } else {
            Ok(integration.clone())
        }
    }

    /// Scrubs credentials and flips the integration to `disconnected`.
    /// Disconnecting an unknown or already disconnected integration is a no-op.
    pub async fn disconnect(&self, key: &IntegrationKey) -> BrokerResult<()> {
        let current = match self.integrations.get(key)? {
            Some(i) if i.status != ConnectionStatus::Disconnected => i,
            _ => return Ok(()),
        };

        self.revoke_best_effort(&current).await;

        self.update_with_retry(key, |integration| {
            if integration.status == ConnectionStatus::Disconnected {
                return Ok(None);
            }
            integration.scrub();
            integration.status = ConnectionStatus::Disconnected;
            integration.last_error = None;
            Ok(Some(HistoryEntry::now("disconnected", "disconnected by seller")))
        })?;

        info!(
            seller_id = %key.seller_id,
            provider = %key.provider,
            environment = %key.environment,
            "Integration disconnected"
        );
        Ok(())
    }

    /// Direct connection for `api_key` and `manual` providers.
    ///
    /// The record is stored `pending`, then verified with the descriptor's
    /// `test` operation when it has one.
    pub async fn connect_with_credentials(
        &self,
        key: &IntegrationKey,
        fields: BTreeMap<String, String>,
    ) -> BrokerResult<SellerIntegration> {
        let descriptor = self
            .registry
            .get(&key.provider)
            .ok_or_else(|| BrokerError::UnsupportedProvider(key.provider.clone()))?;
        if descriptor.is_oauth() {
            return Err(BrokerError::UnsupportedProvider(key.provider.clone()));
        }
        validate_fields(&descriptor, &fields)?;

        let field_count = fields.len();
        let plain = PlainCredentials::new(fields);
        let sealed = self.vault.seal_all(&plain)?;

        let mut integration = self
            .integrations
            .get(key)?
            .unwrap_or_else(|| SellerIntegration::new(key, ConnectionStatus::Pending));
        integration.status = ConnectionStatus::Pending;
        integration.credentials = sealed;
        integration.tokens = None;
        integration.last_error = None;

        self.integrations.save(
            &integration,
            &HistoryEntry::now(
                "credentials_submitted",
                format!("{} credential field(s) stored", field_count),
            ),
        )?;

        let verification = match descriptor.operation("test") {
            None => Ok("no verification operation"),
            Some(template) => {
                match request::prepare(
                    &descriptor,
                    key.environment,
                    template,
                    &serde_json::Map::new(),
                    &plain,
                    None,
                ) {
                    Ok(call) => request::execute(&self.http, &call)
                        .await
                        .map(|_| "credentials verified")
                        .map_err(|failure| failure.into_error(&key.provider)),
                    Err(e) => Err(e),
                }
            }
        };

        match verification {
            Ok(message) => {
                let stored = self.update_with_retry(key, |i| {
                    if i.status != ConnectionStatus::Pending {
                        return Ok(None);
                    }
                    i.status = ConnectionStatus::Connected;
                    Ok(Some(HistoryEntry::now("connected", message)))
                })?;
                info!(
                    seller_id = %key.seller_id,
                    provider = %key.provider,
                    environment = %key.environment,
                    integration_id = %stored.id,
                    "Integration connected with credentials"
                );
                Ok(stored)
            }
            Err(e) => {
                warn!(
                    seller_id = %key.seller_id,
                    provider = %key.provider,
                    environment = %key.environment,
                    code = e.code(),
                    "Credential verification failed"
                );
                let message = e.to_string();
                self.update_with_retry(key, |i| {
                    if i.status != ConnectionStatus::Pending {
                        return Ok(None);
                    }
                    i.status = ConnectionStatus::Error;
                    i.last_error = Some(message.clone());
                    Ok(Some(HistoryEntry::now("error", message.clone())))
                })?;
                Err(e)
            }
        }
    }

    /// Sets the webhook sub-configuration of a connected integration. A signing
    /// secret is generated on first configuration and returned once.
    pub fn configure_webhook(
        &self,
        key: &IntegrationKey,
        enabled: bool,
        url: &str,
    ) -> BrokerResult<WebhookConfigured> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| BrokerError::InvalidInput(format!("invalid webhook URL '{}'", url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BrokerError::InvalidInput(
                "webhook URL must use http or https".into(),
            ));
        }

        let secret = format!("whsec_{}", random_string(32));
        let sealed_secret = self.vault.encrypt(&secret)?;
        let mut issued = false;

        let integration = self.update_with_retry(key, |i| {
            if !i.is_connected() {
                return Err(not_connected(key));
            }
            match &mut i.webhook {
                Some(existing) => {
                    existing.enabled = enabled;
                    existing.url = url.to_string();
                    issued = false;
                }
                None => {
                    i.webhook = Some(WebhookSettings {
                        enabled,
                        url: url.to_string(),
                        secret: sealed_secret.clone(),
                    });
                    issued = true;
                }
            }
            let event = if enabled { "webhook_enabled" } else { "webhook_disabled" };
            Ok(Some(HistoryEntry::now(event, url)))
        })?;

        info!(
            seller_id = %key.seller_id,
            provider = %key.provider,
            environment = %key.environment,
            enabled = enabled,
            "Integration webhook configured"
        );

        Ok(WebhookConfigured {
            integration,
            secret: issued.then_some(secret),
        })
    }

    fn oauth_descriptor(
        &self,
        provider: &str,
    ) -> BrokerResult<(Arc<ProviderDescriptor>, OAuthEndpoints)> {
        let descriptor = self
            .registry
            .get(provider)
            .filter(|d| d.is_oauth())
            .ok_or_else(|| BrokerError::UnsupportedProvider(provider.to_string()))?;
        let endpoints = descriptor
            .oauth
            .clone()
            .ok_or_else(|| BrokerError::UnsupportedProvider(provider.to_string()))?;
        Ok((descriptor, endpoints))
    }

    fn client_for(&self, provider: &str) -> BrokerResult<OAuthClient> {
        self.clients.get(provider).ok_or_else(|| {
            BrokerError::Configuration(format!(
                "OAuth client credentials for '{}' are not configured",
                provider
            ))
        })
    }

    fn seal_tokens(&self, tokens: &TokenSet) -> BrokerResult<OAuthTokens> {
        Ok(OAuthTokens {
            access_token: self.vault.encrypt(&tokens.access_token)?,
            refresh_token: tokens
                .refresh_token
                .as_deref()
                .map(|t| self.vault.encrypt(t))
                .transpose()?,
            expires_at: tokens.expires_at,
        })
    }

    /// Flips the integration to `error` after a failed refresh. If another
    /// writer replaced the tokens meanwhile, its record is kept.
    async fn fail_refresh(
        &self,
        integration: &SellerIntegration,
        message: &str,
    ) -> BrokerResult<SellerIntegration> {
        warn!(
            seller_id = %integration.seller_id,
            provider = %integration.provider,
            environment = %integration.environment,
            integration_id = %integration.id,
            error = %message,
            "OAuth token refresh failed"
        );

        let outcome = self.write_refresh_outcome(
            integration,
            |record| {
                record.status = ConnectionStatus::Error;
                record.last_error = Some(message.to_string());
            },
            &HistoryEntry::now("error", message),
        )?;

        match outcome {
            RefreshWrite::Stored(_) => Err(BrokerError::ReauthorizationRequired {
                provider: integration.provider.clone(),
            }),
            RefreshWrite::Superseded(current) => self.superseded(integration, current),
        }
    }

    /// Applies a refresh outcome through compare-and-swap. A conflicting write
    /// that left the tokens alone (a webhook change, say) is merged over and
    /// retried; one that replaced the tokens supersedes this refresh.
    fn write_refresh_outcome<F>(
        &self,
        started_from: &SellerIntegration,
        apply: F,
        event: &HistoryEntry,
    ) -> BrokerResult<RefreshWrite>
    where
        F: Fn(&mut SellerIntegration),
    {
        let mut base = started_from.clone();
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut updated = base.clone();
            apply(&mut updated);
            if let Some(stored) = self.integrations.compare_and_swap(&updated, event)? {
                return Ok(RefreshWrite::Stored(stored));
            }

            let current = self
                .integrations
                .get_by_id(&started_from.id)?
                .ok_or_else(|| BrokerError::ReauthorizationRequired {
                    provider: started_from.provider.clone(),
                })?;
            if !same_tokens(&current, started_from) {
                debug!(
                    integration_id = %current.id,
                    provider = %current.provider,
                    "Tokens replaced by a concurrent writer"
                );
                return Ok(RefreshWrite::Superseded(current));
            }
            base = current;
        }
        Err(BrokerError::Storage(anyhow!(
            "integration {} is being modified concurrently",
            started_from.key()
        )))
    }

    fn superseded(
        &self,
        integration: &SellerIntegration,
        current: SellerIntegration,
    ) -> BrokerResult<SellerIntegration> {
        if current.is_connected() {
            Ok(current)
        } else {
            Err(BrokerError::ReauthorizationRequired {
                provider: integration.provider.clone(),
            })
        }
    }

    /// Read-modify-write through compare-and-swap. `mutate` returns the history
    /// entry to append, or `None` to leave the record untouched.
    fn update_with_retry<F>(&self, key: &IntegrationKey, mut mutate: F) -> BrokerResult<SellerIntegration>
    where
        F: FnMut(&mut SellerIntegration) -> BrokerResult<Option<HistoryEntry>>,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self
                .integrations
                .get(key)?
                .ok_or_else(|| not_connected(key))?;
            let mut updated = current.clone();
            let event = match mutate(&mut updated)? {
                Some(event) => event,
                None => return Ok(current),
            };
            if let Some(stored) = self.integrations.compare_and_swap(&updated, &event)? {
                return Ok(stored);
            }
        }
        Err(BrokerError::Storage(anyhow!(
            "integration {} is being modified concurrently",
            key
        )))
    }

    async fn revoke_best_effort(&self, integration: &SellerIntegration) {
        let Some(descriptor) = self.registry.get(&integration.provider) else {
            return;
        };
        let Some(revoke_url) = descriptor.oauth.as_ref().and_then(|o| o.revoke_url.as_ref()) else {
            return;
        };
        let Some(tokens) = &integration.tokens else {
            return;
        };
        let Some(client) = self.clients.get(&integration.provider) else {
            return;
        };

        let token = match self.vault.decrypt(&tokens.access_token) {
            Ok(t) => t,
            Err(e) => {
                warn!(integration_id = %integration.id, error = %e, "Cannot open token for revocation");
                return;
            }
        };

        match exchange::revoke_token(&self.http, revoke_url, &client, &token).await {
            Ok(()) => info!(integration_id = %integration.id, "OAuth token revoked"),
            Err(e) => warn!(
                integration_id = %integration.id,
                provider = %integration.provider,
                error = %format!("{:#}", e),
                "OAuth token revocation failed"
            ),
        }
    }
}

fn validate_fields(
    descriptor: &ProviderDescriptor,
    fields: &BTreeMap<String, String>,
) -> BrokerResult<()> {
    for declared in &descriptor.credential_fields {
        match fields.get(declared) {
            Some(value) if !value.trim().is_empty() => {}
            _ => {
                return Err(BrokerError::InvalidInput(format!(
                    "missing credential field '{}'",
                    declared
                )))
            }
        }
    }
    if let Some(unknown) = fields
        .keys()
        .find(|f| !descriptor.credential_fields.contains(f))
    {
        return Err(BrokerError::InvalidInput(format!(
            "unknown credential field '{}'",
            unknown
        )));
    }
    Ok(())
}

fn same_tokens(a: &SellerIntegration, b: &SellerIntegration) -> bool {
    match (&a.tokens, &b.tokens) {
        (Some(x), Some(y)) => x.access_token == y.access_token && x.refresh_token == y.refresh_token,
        (None, None) => true,
        _ => false,
    }
}

fn not_connected(key: &IntegrationKey) -> BrokerError {
    BrokerError::NotConnected {
        provider: key.provider.clone(),
        environment: key.environment.to_string(),
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
