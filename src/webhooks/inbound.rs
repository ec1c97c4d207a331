//! Provider-originated webhooks: signature check, normalization, routing.

use super::signature::verify_signature;
use crate::error::{BrokerError, BrokerResult};
use crate::integration::{IntegrationStore, SellerIntegration};
use crate::providers::ProviderRegistry;
use crate::service::normalize::{extract_records, normalize_record};
use crate::sync::{RecordBatch, SyncKind, SyncSink};
use crate::vault::CredentialVault;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// `{ event, data }` as sent by a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Domain-event handler for one family of inbound events.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(
        &self,
        integration: &SellerIntegration,
        event: &InboundEvent,
    ) -> anyhow::Result<()>;
}

/// Forwards inbound records to the same sink sync jobs write to.
pub struct SinkInboundHandler {
    sink: Arc<dyn SyncSink>,
    kind: SyncKind,
}

impl SinkInboundHandler {
    pub fn new(sink: Arc<dyn SyncSink>, kind: SyncKind) -> Self {
        Self { sink, kind }
    }
}

#[async_trait]
impl InboundHandler for SinkInboundHandler {
    async fn handle(
        &self,
        integration: &SellerIntegration,
        event: &InboundEvent,
    ) -> anyhow::Result<()> {
        let records = extract_records(&event.data, None);
        let key = integration.key();
        self.sink
            .apply(RecordBatch {
                key: &key,
                kind: self.kind,
                job_id: None,
                records: &records,
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Handled,
    Ignored,
}

/// Verifies inbound webhooks and hands them to the handler registered for
/// the longest matching event prefix.
pub struct InboundRouter {
    integrations: Arc<IntegrationStore>,
    registry: Arc<ProviderRegistry>,
    vault: Arc<CredentialVault>,
    routes: Vec<(String, Arc<dyn InboundHandler>)>,
}

impl InboundRouter {
    pub fn new(
        integrations: Arc<IntegrationStore>,
        registry: Arc<ProviderRegistry>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            integrations,
            registry,
            vault,
            routes: Vec::new(),
        }
    }

    /// Routes events starting with `prefix` (e.g. `inventory.`) to `handler`.
    pub fn with_handler(mut self, prefix: impl Into<String>, handler: Arc<dyn InboundHandler>) -> Self {
        self.routes.push((prefix.into(), handler));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub async fn ingest(
        &self,
        integration_id: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> BrokerResult<InboundOutcome> {
        let integration = self
            .integrations
            .get_by_id(integration_id)?
            .filter(|i| i.is_connected())
            .ok_or_else(|| BrokerError::NotFound(format!("integration {}", integration_id)))?;
        let webhook = integration
            .webhook
            .as_ref()
            .filter(|w| w.enabled)
            .ok_or_else(|| {
                BrokerError::NotFound(format!("webhook for integration {}", integration_id))
            })?;

        let secret = self.vault.decrypt(&webhook.secret)?;
        if !verify_signature(&secret, body, signature.unwrap_or_default()) {
            warn!(
                integration_id = %integration.id,
                provider = %integration.provider,
                "Inbound webhook signature mismatch"
            );
            return Err(BrokerError::InvalidSignature);
        }

        let mut event: InboundEvent = serde_json::from_slice(body)
            .map_err(|e| BrokerError::InvalidInput(format!("malformed webhook body: {}", e)))?;

        if let Some(descriptor) = self.registry.get(&integration.provider) {
            let fields = &descriptor.inbound.fields;
            if !fields.is_empty() {
                event.data = match &event.data {
                    Value::Array(items) => {
                        Value::Array(items.iter().map(|r| normalize_record(r, fields)).collect())
                    }
                    other => normalize_record(other, fields),
                };
            }
        }

        let Some((_, handler)) = self
            .routes
            .iter()
            .find(|(prefix, _)| event.event.starts_with(prefix.as_str()))
        else {
            info!(
                integration_id = %integration.id,
                event = %event.event,
                "Ignoring inbound event without handler"
            );
            return Ok(InboundOutcome::Ignored);
        };

        handler
            .handle(&integration, &event)
            .await
            .map_err(BrokerError::Storage)?;

        info!(
            integration_id = %integration.id,
            provider = %integration.provider,
            event = %event.event,
            "Inbound webhook handled"
        );
        Ok(InboundOutcome::Handled)
    }
}
