//! External API-key façade, rate limited per key by subscription tier.
//!
//! Every route is wrapped in [`require_api_key`] with the permission it
//! needs; the middleware answers 401 (missing or unknown key), 403 (inactive,
//! expired, or lacking the permission) and 429 with `Retry-After`.

use super::integrations::parse_environment;
use super::sync::owned_job;
use super::{AppError, AppState};
use crate::api_keys::{ApiKeyService, DenyReason, KeyGrant};
use crate::error::BrokerError;
use crate::integration::{IntegrationKey, IntegrationSummary};
use crate::service::NormalizedResponse;
use crate::sync::SyncJob;
use axum::{
    extract::{Path, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Middleware state: the key service plus the permission a route requires.
#[derive(Clone)]
pub struct KeyGuard {
    keys: Arc<ApiKeyService>,
    permission: &'static str,
}

impl KeyGuard {
    pub fn new(keys: Arc<ApiKeyService>, permission: &'static str) -> Self {
        Self { keys, permission }
    }
}

#[derive(Serialize)]
pub struct ListIntegrationsResponse {
    pub integrations: Vec<IntegrationSummary>,
}

/// Create the `/api/v1` router
pub fn create_v1_router(state: Arc<AppState>) -> Router {
    let guard = |permission| {
        middleware::from_fn_with_state(
            KeyGuard::new(state.api_keys.clone(), permission),
            require_api_key,
        )
    };

    Router::new()
        .route(
            "/api/v1/integrations",
            get(list_integrations).route_layer(guard("integrations:read")),
        )
        .route(
            "/api/v1/sync/jobs/:id",
            get(get_job).route_layer(guard("sync:read")),
        )
        .route(
            "/api/v1/integrations/:provider/:environment/call/:operation",
            post(call_operation).route_layer(guard("integrations:write")),
        )
        .with_state(state)
}

/// Authenticates `X-Api-Key`, meters the request and exposes the [`KeyGrant`]
/// to the handler as an extension.
pub async fn require_api_key(
    State(guard): State<KeyGuard>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Unauthorized("X-Api-Key header required".to_string()))?;

    let grant = match guard.keys.authorize(&key, guard.permission)? {
        Ok(grant) => grant,
        Err(reason) => {
            debug!(permission = guard.permission, reason = ?reason, "API key request denied");
            return Err(deny(reason));
        }
    };

    let remaining = grant.remaining;
    request.extensions_mut().insert(grant);
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(remaining));
    Ok(response)
}

fn deny(reason: DenyReason) -> AppError {
    match reason {
        DenyReason::UnknownKey => AppError::Unauthorized("unknown API key".to_string()),
        DenyReason::Inactive => AppError::Forbidden("API key is inactive".to_string()),
        DenyReason::Expired => AppError::Forbidden("API key has expired".to_string()),
        DenyReason::MissingPermission { permission } => {
            AppError::Forbidden(format!("API key lacks permission '{}'", permission))
        }
        DenyReason::QuotaExceeded { retry_after } => {
            AppError::Broker(BrokerError::QuotaExceeded { retry_after })
        }
    }
}

/// GET /api/v1/integrations
async fn list_integrations(
    State(state): State<Arc<AppState>>,
    Extension(grant): Extension<KeyGrant>,
) -> Result<Json<ListIntegrationsResponse>, AppError> {
    let integrations = state
        .connections
        .integrations()
        .list_by_seller(&grant.seller_id)?
        .iter()
        .map(IntegrationSummary::from)
        .collect();
    Ok(Json(ListIntegrationsResponse { integrations }))
}

/// GET /api/v1/sync/jobs/:id
async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(grant): Extension<KeyGrant>,
    Path(job_id): Path<String>,
) -> Result<Json<SyncJob>, AppError> {
    Ok(Json(owned_job(&state, &grant.seller_id, &job_id)?))
}

/// POST /api/v1/integrations/:provider/:environment/call/:operation
///
/// Body is the operation's parameter object (optional).
async fn call_operation(
    State(state): State<Arc<AppState>>,
    Extension(grant): Extension<KeyGrant>,
    Path((provider, environment, operation)): Path<(String, String, String)>,
    params: Option<Json<Map<String, Value>>>,
) -> Result<Json<NormalizedResponse>, AppError> {
    let key = IntegrationKey::new(
        grant.seller_id,
        provider,
        parse_environment(&environment)?,
    );
    let params = params.map(|Json(p)| p).unwrap_or_default();

    let response = state.service.call(&key, &operation, &params).await?;
    Ok(Json(response))
}
