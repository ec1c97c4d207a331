//! Process-wide component graph.
//!
//! Everything is constructed once at startup and handed around as `Arc`s;
//! the HTTP server and the sync worker build the same graph over the same
//! database file.

use crate::api_keys::{ApiKeyService, ApiKeyStore};
use crate::config::BrokerConfig;
use crate::integration::IntegrationStore;
use crate::oauth::{OAuthClients, OAuthConnectionManager, OAuthSettings, OAuthStateStore};
use crate::providers::ProviderRegistry;
use crate::rate_limit::StaticSubscriptions;
use crate::service::GenericIntegrationService;
use crate::sync::{SyncProgressTracker, SyncRunner, SyncSettings, SyncSink};
use crate::vault::CredentialVault;
use crate::webhooks::{CallbackEndpointStore, DeliveryLog, DispatchSettings, WebhookDispatcher};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub struct Components {
    pub config: BrokerConfig,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<ProviderRegistry>,
    pub integrations: Arc<IntegrationStore>,
    pub states: Arc<OAuthStateStore>,
    pub connections: Arc<OAuthConnectionManager>,
    pub service: Arc<GenericIntegrationService>,
    pub tracker: Arc<SyncProgressTracker>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub sync: Arc<SyncRunner>,
    pub api_keys: Arc<ApiKeyService>,
    pub sink: Arc<dyn SyncSink>,
}

impl Components {
    pub fn build(
        config: BrokerConfig,
        vault: Arc<CredentialVault>,
        registry: Arc<ProviderRegistry>,
        clients: OAuthClients,
        sink: Arc<dyn SyncSink>,
    ) -> Result<Self> {
        let db_path = config.database.path.clone();

        let integrations = Arc::new(IntegrationStore::new(&db_path)?);
        let states = Arc::new(OAuthStateStore::new(config.oauth.state_ttl_secs));
        let connections = Arc::new(OAuthConnectionManager::new(
            registry.clone(),
            vault.clone(),
            states.clone(),
            integrations.clone(),
            clients,
            OAuthSettings::from_config(&config),
        )?);
        let service = Arc::new(GenericIntegrationService::new(connections.clone()));

        let webhooks = Arc::new(WebhookDispatcher::new(
            integrations.clone(),
            Arc::new(CallbackEndpointStore::new(&db_path)?),
            registry.clone(),
            vault.clone(),
            Arc::new(DeliveryLog::new(
                config.webhooks.retention_secs,
                config.webhooks.max_retained,
            )),
            DispatchSettings::from_config(&config.webhooks),
        )?);

        let tracker = Arc::new(SyncProgressTracker::new(&db_path)?);
        let sync = Arc::new(
            SyncRunner::new(
                service.clone(),
                tracker.clone(),
                sink.clone(),
                SyncSettings::from_config(&config.sync),
            )
            .with_webhooks(webhooks.clone()),
        );

        let api_keys = Arc::new(ApiKeyService::new(
            ApiKeyStore::new(&db_path)?,
            vault.clone(),
            Arc::new(StaticSubscriptions::from_config(&config.rate_limit)),
            config.rate_limit.tiers.clone(),
        ));

        info!(
            database = %db_path,
            providers = registry.len(),
            "Broker components initialized"
        );

        Ok(Self {
            config,
            vault,
            registry,
            integrations,
            states,
            connections,
            service,
            tracker,
            webhooks,
            sync,
            api_keys,
            sink,
        })
    }
}
