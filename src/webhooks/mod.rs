//! Outbound webhook fan-out and inbound webhook routing.
//!
//! Delivery is best-effort: [`WebhookDispatcher::dispatch`] never returns an
//! error, and [`WebhookDispatcher::dispatch_detached`] lets the caller finish
//! its own operation without waiting for any receiver.

pub mod endpoints;
mod inbound;
mod log;
mod signature;

pub use endpoints::{CallbackEndpoint, CallbackEndpointStore};
pub use inbound::{InboundEvent, InboundHandler, InboundOutcome, InboundRouter, SinkInboundHandler};
pub use log::{DeliveryLog, DeliveryOutcome, WebhookDelivery};
pub use signature::{sign, verify_signature};

use crate::config::WebhookConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::integration::IntegrationStore;
use crate::providers::ProviderRegistry;
use crate::vault::CredentialVault;
use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delivery timing knobs.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Body of every outbound webhook.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    data: &'a Value,
    timestamp: String,
}

/// A resolved receiver with its plaintext signing secret.
struct Target {
    url: String,
    secret: String,
}

pub struct WebhookDispatcher {
    integrations: Arc<IntegrationStore>,
    endpoints: Arc<CallbackEndpointStore>,
    registry: Arc<ProviderRegistry>,
    vault: Arc<CredentialVault>,
    log: Arc<DeliveryLog>,
    http: reqwest::Client,
    settings: DispatchSettings,
}

impl WebhookDispatcher {
    pub fn new(
        integrations: Arc<IntegrationStore>,
        endpoints: Arc<CallbackEndpointStore>,
        registry: Arc<ProviderRegistry>,
        vault: Arc<CredentialVault>,
        log: Arc<DeliveryLog>,
        settings: DispatchSettings,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("integration-broker-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            integrations,
            endpoints,
            registry,
            vault,
            log,
            http,
            settings,
        })
    }

    pub fn log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    /// Registers a generic callback URL for a seller. The signing secret is
    /// returned in plaintext once and stored sealed.
    pub fn register_endpoint(
        &self,
        seller_id: &str,
        url: &str,
        events: Vec<String>,
    ) -> BrokerResult<(CallbackEndpoint, String)> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| BrokerError::InvalidInput(format!("invalid callback URL '{}'", url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BrokerError::InvalidInput(
                "callback URL must use http or https".into(),
            ));
        }
        if events.is_empty() || events.iter().any(|e| e.trim().is_empty()) {
            return Err(BrokerError::InvalidInput(
                "at least one event pattern is required".into(),
            ));
        }

        let secret: String = format!(
            "whsec_{}",
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect::<String>()
        );
        let endpoint = CallbackEndpoint {
            id: uuid::Uuid::now_v7().to_string(),
            seller_id: seller_id.to_string(),
            url: url.to_string(),
            secret: self.vault.encrypt(&secret)?,
            events,
            active: true,
            created_at: Utc::now(),
        };
        self.endpoints.insert(&endpoint)?;

        info!(
            seller_id = %seller_id,
            endpoint_id = %endpoint.id,
            "Callback endpoint registered"
        );
        Ok((endpoint, secret))
    }

    pub fn list_endpoints(&self, seller_id: &str) -> BrokerResult<Vec<CallbackEndpoint>> {
        Ok(self.endpoints.list_by_seller(seller_id)?)
    }

    /// Stops deliveries to an endpoint; its record is kept.
    pub fn deactivate_endpoint(&self, seller_id: &str, endpoint_id: &str) -> BrokerResult<()> {
        if !self.endpoints.set_active(seller_id, endpoint_id, false)? {
            return Err(BrokerError::NotFound(format!(
                "callback endpoint {}",
                endpoint_id
            )));
        }
        info!(seller_id = %seller_id, endpoint_id = %endpoint_id, "Callback endpoint deactivated");
        Ok(())
    }

    /// Delivers `event` to every receiver of the seller that wants it.
    ///
    /// Receivers are seller integrations with an enabled webhook whose provider
    /// subscribes to the event, plus the seller's active callback endpoints.
    /// Deliveries run concurrently; outcomes are recorded in the delivery log
    /// and returned.
    pub async fn dispatch(&self, seller_id: &str, event: &str, data: Value) -> Vec<WebhookDelivery> {
        let targets = self.targets(seller_id, event);
        if targets.is_empty() {
            debug!(seller_id = %seller_id, event = %event, "No webhook receivers");
            return Vec::new();
        }

        let payload = WebhookPayload {
            event,
            data: &data,
            timestamp: Utc::now().to_rfc3339(),
        };
        // The logged payload and the signed body must be the same bytes
        let encoded = serde_json::to_value(&payload)
            .and_then(|value| serde_json::to_vec(&value).map(|body| (value, body)));
        let (payload_value, body) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(seller_id = %seller_id, event = %event, error = %e, "Failed to encode webhook payload");
                return Vec::new();
            }
        };

        let deliveries = join_all(
            targets
                .iter()
                .map(|target| self.deliver(seller_id, event, &body, &payload_value, target)),
        )
        .await;

        for delivery in &deliveries {
            self.log.record(delivery.clone());
        }
        deliveries
    }

    /// Runs [`dispatch`](Self::dispatch) on its own task.
    pub fn dispatch_detached(
        self: &Arc<Self>,
        seller_id: &str,
        event: &str,
        data: Value,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let seller_id = seller_id.to_string();
        let event = event.to_string();
        tokio::spawn(async move {
            dispatcher.dispatch(&seller_id, &event, data).await;
        })
    }

    fn targets(&self, seller_id: &str, event: &str) -> Vec<Target> {
        let mut targets = Vec::new();

        match self.integrations.list_webhook_targets(seller_id) {
            Ok(integrations) => {
                for integration in integrations {
                    let wanted = self
                        .registry
                        .get(&integration.provider)
                        .map_or(false, |d| d.wants_event(event));
                    let Some(webhook) = integration.webhook.filter(|_| wanted) else {
                        continue;
                    };
                    match self.vault.decrypt(&webhook.secret) {
                        Ok(secret) => targets.push(Target {
                            url: webhook.url,
                            secret,
                        }),
                        Err(e) => warn!(
                            integration_id = %integration.id,
                            error = %e,
                            "Skipping webhook target with unreadable secret"
                        ),
                    }
                }
            }
            Err(e) => warn!(seller_id = %seller_id, error = %e, "Failed to load webhook targets"),
        }

        match self.endpoints.list_by_seller(seller_id) {
            Ok(endpoints) => {
                for endpoint in endpoints.into_iter().filter(|e| e.wants_event(event)) {
                    match self.vault.decrypt(&endpoint.secret) {
                        Ok(secret) => targets.push(Target {
                            url: endpoint.url,
                            secret,
                        }),
                        Err(e) => warn!(
                            endpoint_id = %endpoint.id,
                            error = %e,
                            "Skipping callback endpoint with unreadable secret"
                        ),
                    }
                }
            }
            Err(e) => warn!(seller_id = %seller_id, error = %e, "Failed to load callback endpoints"),
        }

        targets
    }

    async fn deliver(
        &self,
        seller_id: &str,
        event: &str,
        body: &[u8],
        payload: &Value,
        target: &Target,
    ) -> WebhookDelivery {
        let delivery_id = uuid::Uuid::now_v7().to_string();
        let signature = sign(&target.secret, body);
        let mut attempts = 0;
        let mut outcome = DeliveryOutcome::Failed {
            reason: "not attempted".to_string(),
        };

        while attempts < self.settings.max_attempts {
            if attempts > 0 {
                let backoff = self.settings.backoff * 2u32.saturating_pow(attempts - 1);
                tokio::time::sleep(backoff).await;
            }
            attempts += 1;

            let result = self
                .http
                .post(&target.url)
                .timeout(self.settings.timeout)
                .header("Content-Type", "application/json")
                .header("X-Signature", &signature)
                .header("X-Webhook-Event", event)
                .header("X-Webhook-Delivery", &delivery_id)
                .body(body.to_vec())
                .send()
                .await;

            outcome = match result {
                Ok(response) if response.status().is_success() => DeliveryOutcome::Delivered {
                    status: response.status().as_u16(),
                },
                Ok(response) => DeliveryOutcome::Failed {
                    reason: format!("receiver returned status {}", response.status().as_u16()),
                },
                Err(e) if e.is_timeout() => DeliveryOutcome::Failed {
                    reason: "timed out".to_string(),
                },
                Err(e) => DeliveryOutcome::Failed {
                    reason: e.without_url().to_string(),
                },
            };

            if outcome.is_delivered() {
                break;
            }
            debug!(
                delivery_id = %delivery_id,
                attempt = attempts,
                "Webhook attempt failed"
            );
        }

        match &outcome {
            DeliveryOutcome::Delivered { status } => info!(
                seller_id = %seller_id,
                event = %event,
                delivery_id = %delivery_id,
                status = status,
                attempts = attempts,
                "Webhook delivered"
            ),
            DeliveryOutcome::Failed { reason } => warn!(
                seller_id = %seller_id,
                event = %event,
                delivery_id = %delivery_id,
                attempts = attempts,
                reason = %reason,
                "Webhook delivery failed"
            ),
        }

        WebhookDelivery {
            id: delivery_id,
            seller_id: seller_id.to_string(),
            event: event.to_string(),
            url: target.url.clone(),
            payload: payload.clone(),
            signature,
            attempts,
            outcome,
            at: Utc::now(),
        }
    }
}
