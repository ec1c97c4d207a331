//! Seller-facing connection endpoints.
//!
//! OAuth providers connect through authorize/callback; `api_key` and `manual`
//! providers take raw credential fields on `connect`.

use super::{AppError, AppState};
use crate::error::BrokerError;
use crate::integration::{Environment, IntegrationKey, IntegrationSummary};
use crate::oauth::CallbackParams;
use crate::providers::ProviderSummary;
use crate::sync::{SyncJob, SyncKind};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderSummary>,
}

#[derive(Serialize)]
pub struct ListIntegrationsResponse {
    pub integrations: Vec<IntegrationSummary>,
}

/// Request body for POST /api/integrations/:provider/:environment/connect
#[derive(Deserialize)]
pub struct ConnectRequest {
    pub credentials: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Request body for PUT /api/integrations/:provider/:environment/webhook
#[derive(Deserialize)]
pub struct WebhookRequest {
    pub enabled: bool,
    pub url: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub integration: IntegrationSummary,
    /// Only present when this call generated the signing secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Request body for POST /api/integrations/:provider/:environment/sync
#[derive(Deserialize, Default)]
pub struct StartSyncRequest {
    #[serde(default)]
    pub kind: Option<SyncKind>,
}

#[derive(Serialize)]
pub struct SyncStartedResponse {
    pub job_id: String,
    pub kind: SyncKind,
    /// True when a job of this kind was already running and is returned instead.
    pub already_running: bool,
}

/// Create integration API router
pub fn create_integration_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/integrations", get(list_integrations))
        .route(
            "/api/integrations/:provider/:environment/oauth/authorize",
            get(authorize),
        )
        .route(
            "/api/integrations/:provider/:environment/oauth/callback",
            get(callback),
        )
        .route(
            "/api/integrations/:provider/:environment/connect",
            post(connect),
        )
        .route(
            "/api/integrations/:provider/:environment/disconnect",
            post(disconnect),
        )
        .route(
            "/api/integrations/:provider/:environment/webhook",
            put(configure_webhook),
        )
        .route(
            "/api/integrations/:provider/:environment/sync",
            post(start_sync),
        )
        .with_state(state)
}

pub(crate) fn parse_environment(value: &str) -> Result<Environment, AppError> {
    value
        .parse()
        .map_err(|e: String| AppError::Broker(BrokerError::InvalidInput(e)))
}

/// GET /api/providers
async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListProvidersResponse>, AppError> {
    state.seller(&headers)?;

    let providers = state
        .registry
        .list()
        .iter()
        .map(|d| ProviderSummary::from(d.as_ref()))
        .collect();
    Ok(Json(ListProvidersResponse { providers }))
}

/// GET /api/integrations - the seller's integrations in every environment
async fn list_integrations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListIntegrationsResponse>, AppError> {
    let seller_id = state.seller(&headers)?;

    let integrations = state
        .connections
        .integrations()
        .list_by_seller(&seller_id)?
        .iter()
        .map(IntegrationSummary::from)
        .collect();
    Ok(Json(ListIntegrationsResponse { integrations }))
}

/// GET /api/integrations/:provider/:environment/oauth/authorize
///
/// Redirects the seller to the provider's consent page.
async fn authorize(
    State(state): State<Arc<AppState>>,
    Path((provider, environment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let seller_id = state.seller(&headers)?;
    let environment = parse_environment(&environment)?;

    let url = state
        .connections
        .begin_authorize(&seller_id, &provider, environment)?;
    Ok(Redirect::temporary(&url))
}

/// GET /api/integrations/:provider/:environment/oauth/callback
///
/// No session: the state token carries the seller. Always answers with a
/// redirect to the integrations screen, carrying either `status=connected`
/// or a machine-readable `error` code.
async fn callback(
    State(state): State<Arc<AppState>>,
    Path((provider, environment)): Path<(String, String)>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    debug!(provider = %provider, "OAuth callback received");

    let environment = match environment.parse::<Environment>() {
        Ok(env) => env,
        Err(_) => {
            return ui_redirect(
                &state.integrations_ui_url,
                &[("error", "invalid_input"), ("provider", provider.as_str())],
            )
        }
    };

    match state
        .connections
        .handle_callback(&provider, environment, &params)
        .await
    {
        Ok(integration) => ui_redirect(
            &state.integrations_ui_url,
            &[
                ("status", "connected"),
                ("provider", provider.as_str()),
                ("environment", environment.as_str()),
                ("integration_id", integration.id.as_str()),
            ],
        ),
        Err(e) => {
            warn!(
                provider = %provider,
                environment = %environment,
                code = e.code(),
                "OAuth callback failed"
            );
            ui_redirect(
                &state.integrations_ui_url,
                &[
                    ("error", e.code()),
                    ("provider", provider.as_str()),
                    ("environment", environment.as_str()),
                ],
            )
        }
    }
}

fn ui_redirect(base: &str, params: &[(&str, &str)]) -> Redirect {
    let query = serde_urlencoded::to_string(params).unwrap_or_default();
    let separator = if base.contains('?') { '&' } else { '?' };
    Redirect::temporary(&format!("{}{}{}", base, separator, query))
}

/// POST /api/integrations/:provider/:environment/connect
async fn connect(
    State(state): State<Arc<AppState>>,
    Path((provider, environment)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ConnectRequest>,
) -> Result<Json<IntegrationSummary>, AppError> {
    let seller_id = state.seller(&headers)?;
    let key = IntegrationKey::new(seller_id, provider, parse_environment(&environment)?);

    let integration = state
        .connections
        .connect_with_credentials(&key, body.credentials)
        .await?;
    Ok(Json(IntegrationSummary::from(&integration)))
}

/// POST /api/integrations/:provider/:environment/disconnect
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path((provider, environment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let seller_id = state.seller(&headers)?;
    let key = IntegrationKey::new(seller_id, provider, parse_environment(&environment)?);

    state.connections.disconnect(&key).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// PUT /api/integrations/:provider/:environment/webhook
async fn configure_webhook(
    State(state): State<Arc<AppState>>,
    Path((provider, environment)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<WebhookRequest>,
) -> Result<Json<WebhookResponse>, AppError> {
    let seller_id = state.seller(&headers)?;
    let key = IntegrationKey::new(seller_id, provider, parse_environment(&environment)?);

    let configured = state
        .connections
        .configure_webhook(&key, body.enabled, &body.url)?;
    Ok(Json(WebhookResponse {
        integration: IntegrationSummary::from(&configured.integration),
        secret: configured.secret,
    }))
}

/// POST /api/integrations/:provider/:environment/sync
///
/// Starts a background sync job and answers 202 with its id. A job of the
/// same kind that is still running is returned instead of starting another.
async fn start_sync(
    State(state): State<Arc<AppState>>,
    Path((provider, environment)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<StartSyncRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let seller_id = state.seller(&headers)?;
    let key = IntegrationKey::new(seller_id, provider, parse_environment(&environment)?);
    let kind = body
        .and_then(|Json(b)| b.kind)
        .unwrap_or(SyncKind::Inventory);

    let start = state.sync.start(&key, kind)?;
    info!(
        seller_id = %key.seller_id,
        provider = %key.provider,
        environment = %key.environment,
        job_id = %start.job.id,
        already_running = !start.created,
        "Sync requested"
    );
    Ok((StatusCode::ACCEPTED, Json(started(&start.job, !start.created))))
}

fn started(job: &SyncJob, already_running: bool) -> SyncStartedResponse {
    SyncStartedResponse {
        job_id: job.id.clone(),
        kind: job.kind,
        already_running,
    }
}
