//! API key management for sellers.

use super::{AppError, AppState};
use crate::api_keys::ApiKeyView;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{delete, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request body for POST /api/keys
#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The only response that ever carries the full key and its secret.
#[derive(Serialize)]
pub struct CreateKeyResponse {
    #[serde(flatten)]
    pub view: ApiKeyView,
    pub key: String,
    pub secret: String,
}

#[derive(Serialize)]
pub struct ListKeysResponse {
    pub keys: Vec<ApiKeyView>,
}

/// Create API key router
pub fn create_key_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/keys", post(create_key).get(list_keys))
        .route("/api/keys/:id", delete(deactivate_key))
        .with_state(state)
}

/// POST /api/keys
async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let seller_id = state.seller(&headers)?;
    let issued = state
        .api_keys
        .create(&seller_id, &body.name, body.permissions, body.expires_at)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            view: ApiKeyView::from(&issued.record),
            key: issued.record.key.clone(),
            secret: issued.secret,
        }),
    ))
}

/// GET /api/keys
async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListKeysResponse>, AppError> {
    let seller_id = state.seller(&headers)?;
    let keys = state
        .api_keys
        .list(&seller_id)?
        .iter()
        .map(ApiKeyView::from)
        .collect();
    Ok(Json(ListKeysResponse { keys }))
}

/// DELETE /api/keys/:id - deactivates the key
async fn deactivate_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let seller_id = state.seller(&headers)?;
    state.api_keys.deactivate(&seller_id, &key_id)?;
    Ok(StatusCode::NO_CONTENT)
}
