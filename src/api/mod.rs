// HTTP boundary

mod error;
pub mod integrations;
pub mod keys;
pub mod sync;
pub mod v1;
pub mod webhooks;

pub use error::{retry_after_secs, AppError, ErrorResponse};

use crate::api_keys::ApiKeyService;
use crate::auth::{SessionResolver, StaticSessions};
use crate::components::Components;
use crate::oauth::OAuthConnectionManager;
use crate::providers::ProviderRegistry;
use crate::service::GenericIntegrationService;
use crate::sync::{SyncKind, SyncRunner};
use crate::webhooks::{InboundRouter, SinkInboundHandler, WebhookDispatcher};
use axum::{http::HeaderMap, Router};
use std::sync::Arc;

/// Shared application state for every route
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub connections: Arc<OAuthConnectionManager>,
    pub service: Arc<GenericIntegrationService>,
    pub sync: Arc<SyncRunner>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub inbound: Arc<InboundRouter>,
    pub api_keys: Arc<ApiKeyService>,
    pub sessions: Arc<dyn SessionResolver>,
    /// Seller-facing integrations screen the OAuth callback lands on.
    pub integrations_ui_url: String,
}

impl AppState {
    pub fn new(components: &Components, sessions: Arc<dyn SessionResolver>) -> Self {
        let inbound = InboundRouter::new(
            components.integrations.clone(),
            components.registry.clone(),
            components.vault.clone(),
        )
        .with_handler(
            "inventory.",
            Arc::new(SinkInboundHandler::new(
                components.sink.clone(),
                SyncKind::Inventory,
            )),
        )
        .with_handler(
            "order.",
            Arc::new(SinkInboundHandler::new(
                components.sink.clone(),
                SyncKind::Orders,
            )),
        );

        Self {
            registry: components.registry.clone(),
            connections: components.connections.clone(),
            service: components.service.clone(),
            sync: components.sync.clone(),
            webhooks: components.webhooks.clone(),
            inbound: Arc::new(inbound),
            api_keys: components.api_keys.clone(),
            sessions,
            integrations_ui_url: components.config.server.integrations_ui_url.clone(),
        }
    }

    /// State with sessions taken from `[sessions]`.
    pub fn from_components(components: &Components) -> Self {
        let sessions = StaticSessions::from_config(&components.config.sessions);
        Self::new(components, Arc::new(sessions))
    }

    /// Seller behind the request's session token.
    pub(crate) fn seller(&self, headers: &HeaderMap) -> Result<String, AppError> {
        Ok(self.sessions.seller_from_headers(headers)?)
    }
}

/// Every route of the broker: seller-session routes, the provider ingest
/// route and the API-key façade.
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(integrations::create_integration_router(state.clone()))
        .merge(sync::create_sync_router(state.clone()))
        .merge(webhooks::create_webhook_router(state.clone()))
        .merge(keys::create_key_router(state.clone()))
        .merge(v1::create_v1_router(state))
}
