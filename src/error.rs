//! Error taxonomy shared by every broker component.
//!
//! Storage layers return `anyhow::Result` and are folded into
//! [`BrokerError::Storage`] at the component boundary.

use crate::vault::DecryptionError;
use std::time::Duration;

/// Errors surfaced by the OAuth, integration-call, sync and rate-limit layers.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Callback state missing, expired, already consumed, or bound to another provider/environment.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    #[error("provider '{0}' is not supported for this flow")]
    UnsupportedProvider(String),

    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// The stored refresh token is dead; the seller has to authorize again.
    #[error("provider '{provider}' requires reauthorization")]
    ReauthorizationRequired { provider: String },

    #[error("operation '{operation}' is not supported by provider '{provider}'")]
    UnsupportedOperation { provider: String, operation: String },

    /// Timeout, connection failure or 5xx from the provider.
    #[error("provider '{provider}' is unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// 4xx (other than 401) from the provider; `body` is kept for diagnostics.
    #[error("provider '{provider}' rejected the request with status {status}")]
    InvalidRequest {
        provider: String,
        status: u16,
        body: String,
    },

    /// The call still failed after the single refresh-and-retry.
    #[error("integration call failed: {0}")]
    IntegrationCallFailed(String),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error("sync failed: {0}")]
    SyncFailed(String),

    #[error("sync cancelled")]
    SyncCancelled,

    #[error("quota exceeded, retry after {}s", retry_after.as_secs_f64().ceil())]
    QuotaExceeded { retry_after: Duration },

    #[error("integration with '{provider}' ({environment}) is not connected")]
    NotConnected {
        provider: String,
        environment: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Inbound webhook whose signature does not match the integration's secret.
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl BrokerError {
    /// Stable machine-readable code used in redirects and JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidState => "invalid_state",
            BrokerError::UnsupportedProvider(_) => "unsupported_provider",
            BrokerError::TokenExchangeFailed(_) => "token_exchange_failed",
            BrokerError::ReauthorizationRequired { .. } => "reauthorization_required",
            BrokerError::UnsupportedOperation { .. } => "unsupported_operation",
            BrokerError::ProviderUnavailable { .. } => "provider_unavailable",
            BrokerError::InvalidRequest { .. } => "invalid_request",
            BrokerError::IntegrationCallFailed(_) => "integration_call_failed",
            BrokerError::Decryption(_) => "decryption_error",
            BrokerError::SyncFailed(_) => "sync_failed",
            BrokerError::SyncCancelled => "sync_cancelled",
            BrokerError::QuotaExceeded { .. } => "quota_exceeded",
            BrokerError::NotConnected { .. } => "not_connected",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::InvalidInput(_) => "invalid_input",
            BrokerError::Configuration(_) => "configuration_error",
            BrokerError::InvalidSignature => "invalid_signature",
            BrokerError::Storage(_) => "internal_error",
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
