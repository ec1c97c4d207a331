//! The single dispatch point for provider calls.
//!
//! Every feature that talks to a provider (inventory sync, labels, metrics,
//! tax lookups) goes through [`GenericIntegrationService::call_api`], which
//! reads the operation template from the provider's descriptor instead of
//! branching on provider identity.

pub mod normalize;
pub mod request;

use crate::error::{BrokerError, BrokerResult};
use crate::integration::{ConnectionStatus, IntegrationKey, SellerIntegration};
use crate::oauth::OAuthConnectionManager;
use crate::providers::{OperationTemplate, ProviderDescriptor};
use request::{CallFailure, PreparedCall};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// First call plus the single retry after a token refresh.
const MAX_ATTEMPTS: usize = 2;

/// Provider reply after record extraction and canonical field mapping.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedResponse {
    pub provider: String,
    pub operation: String,
    pub status: u16,
    pub records: Vec<Value>,
    pub raw: Value,
}

pub struct GenericIntegrationService {
    connections: Arc<OAuthConnectionManager>,
}

impl GenericIntegrationService {
    pub fn new(connections: Arc<OAuthConnectionManager>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<OAuthConnectionManager> {
        &self.connections
    }

    /// Loads the integration for `key` and calls `operation` on it.
    pub async fn call(
        &self,
        key: &IntegrationKey,
        operation: &str,
        params: &Map<String, Value>,
    ) -> BrokerResult<NormalizedResponse> {
        let integration = self
            .connections
            .integrations()
            .get(key)?
            .ok_or_else(|| BrokerError::NotConnected {
                provider: key.provider.clone(),
                environment: key.environment.to_string(),
            })?;
        let descriptor = self
            .connections
            .registry()
            .get(&key.provider)
            .ok_or_else(|| BrokerError::UnsupportedProvider(key.provider.clone()))?;

        self.call_api(&integration, &descriptor, operation, params)
            .await
    }

    /// Calls `operation` for a connected integration.
    ///
    /// OAuth tokens about to expire are refreshed before the call. A 401 on an
    /// OAuth provider triggers one refresh and one retry, unless a refresh
    /// already happened for this call; a failure after the refresh is final.
    pub async fn call_api(
        &self,
        integration: &SellerIntegration,
        descriptor: &ProviderDescriptor,
        operation: &str,
        params: &Map<String, Value>,
    ) -> BrokerResult<NormalizedResponse> {
        let result = self
            .call_inner(integration, descriptor, operation, params)
            .await;

        if let Err(e) = &result {
            error!(
                integration_id = %integration.id,
                provider = %descriptor.name,
                operation = %operation,
                code = e.code(),
                error = %e,
                "Integration call failed"
            );
        }
        result
    }

    async fn call_inner(
        &self,
        integration: &SellerIntegration,
        descriptor: &ProviderDescriptor,
        operation: &str,
        params: &Map<String, Value>,
    ) -> BrokerResult<NormalizedResponse> {
        let template =
            descriptor
                .operation(operation)
                .ok_or_else(|| BrokerError::UnsupportedOperation {
                    provider: descriptor.name.clone(),
                    operation: operation.to_string(),
                })?;

        match integration.status {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Error => {
                return Err(BrokerError::ReauthorizationRequired {
                    provider: descriptor.name.clone(),
                })
            }
            ConnectionStatus::Pending | ConnectionStatus::Disconnected => {
                return Err(BrokerError::NotConnected {
                    provider: descriptor.name.clone(),
                    environment: integration.environment.to_string(),
                })
            }
        }

        let oauth = descriptor.is_oauth();
        let mut current = integration.clone();
        let mut refreshed = false;
        if oauth && self.connections.needs_refresh(&current) {
            current = self.connections.refresh(&current).await?;
            refreshed = true;
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let call = self.prepare_call(descriptor, &current, template, params)?;
            debug!(
                integration_id = %current.id,
                provider = %descriptor.name,
                operation = %operation,
                attempt = attempt,
                "Calling provider"
            );

            match request::execute(self.connections.http(), &call).await {
                Ok(reply) => {
                    let records = normalize::extract_records(&reply.body, template.items_path.as_deref())
                        .iter()
                        .map(|record| normalize::normalize_record(record, &template.fields))
                        .collect();
                    return Ok(NormalizedResponse {
                        provider: descriptor.name.clone(),
                        operation: operation.to_string(),
                        status: reply.status,
                        records,
                        raw: reply.body,
                    });
                }
                Err(CallFailure::Unauthorized { .. })
                    if oauth && !refreshed && attempt < MAX_ATTEMPTS =>
                {
                    warn!(
                        integration_id = %current.id,
                        provider = %descriptor.name,
                        operation = %operation,
                        "Provider rejected the access token, refreshing"
                    );
                    current = self.connections.refresh(&current).await?;
                    refreshed = true;
                }
                // Pre-emptive or reactive, the one refresh has been spent
                Err(failure) if refreshed => {
                    return Err(BrokerError::IntegrationCallFailed(format!(
                        "{} '{}' still failing after token refresh: {}",
                        descriptor.name, operation, failure
                    )));
                }
                Err(failure) => return Err(failure.into_error(&descriptor.name)),
            }
        }

        Err(BrokerError::IntegrationCallFailed(format!(
            "{} '{}' exhausted its attempts",
            descriptor.name, operation
        )))
    }

    fn prepare_call(
        &self,
        descriptor: &ProviderDescriptor,
        integration: &SellerIntegration,
        template: &OperationTemplate,
        params: &Map<String, Value>,
    ) -> BrokerResult<PreparedCall> {
        let vault = self.connections.vault();
        let credentials = vault.open_all(&integration.credentials)?;

        let access_token = if descriptor.is_oauth() {
            let tokens = integration.tokens.as_ref().ok_or_else(|| {
                BrokerError::ReauthorizationRequired {
                    provider: descriptor.name.clone(),
                }
            })?;
            Some(vault.decrypt(&tokens.access_token)?)
        } else {
            None
        };

        request::prepare(
            descriptor,
            integration.environment,
            template,
            params,
            &credentials,
            access_token.as_deref(),
        )
    }
}
