use crate::auth::TokenError;
use crate::error::BrokerError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Duration;

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    Broker(BrokerError),
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::Broker(e)
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        AppError::Unauthorized(e.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Broker(BrokerError::Storage(e))
    }
}

/// HTTP status for a domain error.
pub fn status_for(e: &BrokerError) -> StatusCode {
    match e {
        BrokerError::InvalidState
        | BrokerError::UnsupportedOperation { .. }
        | BrokerError::InvalidRequest { .. }
        | BrokerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        BrokerError::InvalidSignature => StatusCode::UNAUTHORIZED,
        BrokerError::UnsupportedProvider(_) | BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::ReauthorizationRequired { .. }
        | BrokerError::NotConnected { .. }
        | BrokerError::SyncCancelled => StatusCode::CONFLICT,
        BrokerError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        BrokerError::TokenExchangeFailed(_) | BrokerError::IntegrationCallFailed(_) => {
            StatusCode::BAD_GATEWAY
        }
        BrokerError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Decryption(_)
        | BrokerError::SyncFailed(_)
        | BrokerError::Configuration(_)
        | BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `Retry-After` value in whole seconds, rounded up, never below 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs_f64().ceil().max(1.0) as u64
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, retry_after) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            AppError::Broker(e) => {
                let status = status_for(&e);
                let retry_after = match &e {
                    BrokerError::QuotaExceeded { retry_after } => Some(*retry_after),
                    _ => None,
                };
                let message = match &e {
                    // Storage details stay in the logs
                    BrokerError::Storage(inner) => {
                        tracing::error!(error = %format!("{:#}", inner), "Internal error");
                        "internal error".to_string()
                    }
                    other => other.to_string(),
                };
                (status, e.code(), message, retry_after)
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });
        let mut response = (status, body).into_response();
        if let Some(retry_after) = retry_after {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }
        response
    }
}
