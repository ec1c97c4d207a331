//! Seller callback endpoints, delivery history and provider ingest.

use super::{AppError, AppState};
use crate::webhooks::{CallbackEndpoint, InboundOutcome, WebhookDelivery};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Request body for POST /api/webhooks/endpoints
#[derive(Deserialize)]
pub struct RegisterEndpointRequest {
    pub url: String,
    pub events: Vec<String>,
}

#[derive(Serialize)]
pub struct RegisterEndpointResponse {
    pub endpoint: CallbackEndpoint,
    /// Signing secret, shown once.
    pub secret: String,
}

#[derive(Serialize)]
pub struct ListEndpointsResponse {
    pub endpoints: Vec<CallbackEndpoint>,
}

#[derive(Serialize)]
pub struct ListDeliveriesResponse {
    pub deliveries: Vec<WebhookDelivery>,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
}

/// Create webhook API router
pub fn create_webhook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/webhooks/endpoints",
            post(register_endpoint).get(list_endpoints),
        )
        .route("/api/webhooks/endpoints/:id", delete(deactivate_endpoint))
        .route("/api/webhooks/deliveries", get(list_deliveries))
        .route("/api/webhooks/ingest/:integration_id", post(ingest))
        .with_state(state)
}

/// POST /api/webhooks/endpoints
async fn register_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterEndpointRequest>,
) -> Result<impl IntoResponse, AppError> {
    let seller_id = state.seller(&headers)?;
    let (endpoint, secret) = state
        .webhooks
        .register_endpoint(&seller_id, &body.url, body.events)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterEndpointResponse { endpoint, secret }),
    ))
}

/// GET /api/webhooks/endpoints
async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListEndpointsResponse>, AppError> {
    let seller_id = state.seller(&headers)?;
    let endpoints = state.webhooks.list_endpoints(&seller_id)?;
    Ok(Json(ListEndpointsResponse { endpoints }))
}

/// DELETE /api/webhooks/endpoints/:id - deactivates the endpoint
async fn deactivate_endpoint(
    State(state): State<Arc<AppState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let seller_id = state.seller(&headers)?;
    state
        .webhooks
        .deactivate_endpoint(&seller_id, &endpoint_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/webhooks/deliveries - recent deliveries, newest first
async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListDeliveriesResponse>, AppError> {
    let seller_id = state.seller(&headers)?;
    let deliveries = state.webhooks.log().recent(&seller_id);
    Ok(Json(ListDeliveriesResponse { deliveries }))
}

/// POST /api/webhooks/ingest/:integration_id
///
/// Provider-originated; authenticated by `X-Signature` over the raw body
/// instead of a seller session.
async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok());
    debug!(
        integration_id = %integration_id,
        bytes = body.len(),
        "Inbound webhook received"
    );

    let outcome = state
        .inbound
        .ingest(&integration_id, &body, signature)
        .await?;
    let status = match outcome {
        InboundOutcome::Handled => "handled",
        InboundOutcome::Ignored => "ignored",
    };
    Ok(Json(IngestResponse { status }))
}
