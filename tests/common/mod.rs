// Shared fixture for the HTTP integration tests: a full component graph over
// in-memory SQLite, with every provider pointed at a mockito server.
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use broker::api::{create_router, AppState};
use broker::components::Components;
use broker::config::BrokerConfig;
use broker::oauth::{OAuthClient, OAuthClients};
use broker::providers::ProviderRegistry;
use broker::rate_limit::Quota;
use broker::sync::TracingSink;
use broker::vault::CredentialVault;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

pub const UI_URL: &str = "https://app.test/integrations";

pub fn providers_toml(base: &str) -> String {
    format!(
        r#"
        [[providers]]
        name = "shipbob"
        category = "warehouse"
        auth_mode = "oauth2"
        webhook_events = ["order.*"]

        [providers.oauth]
        authorize_url = "https://auth.shipbob.test/authorize"
        token_url = "{base}/token"
        scopes = ["inventory_read"]

        [providers.base_url]
        sandbox = "{base}/sandbox"
        live = "{base}/live"

        [providers.operations.syncMetrics]
        method = "GET"
        path = "/metrics"

        [providers.inbound.fields]
        quantity = {{ sources = ["on_hand"], kind = "integer" }}

        [[providers]]
        name = "printful"
        category = "dropshipping"
        auth_mode = "api_key"
        credential_fields = ["api_key"]

        [[providers.auth]]
        location = "header"
        name = "X-Api-Token"
        field = "api_key"

        [providers.base_url]
        sandbox = "{base}/pf-sandbox"
        live = "{base}/pf"

        [providers.operations.test]
        method = "GET"
        path = "/store"

        [providers.operations.searchProducts]
        method = "GET"
        path = "/products"
        query = {{ page = "{{page}}", limit = "{{page_size}}" }}
        items_path = "/result"

        [providers.operations.searchProducts.fields]
        quantity = {{ sources = ["stock"], kind = "integer" }}
        "#,
        base = base
    )
}

pub struct TestApp {
    pub router: Router,
    pub components: Components,
}

/// Sessions: `sess-1` → `seller-1`, `sess-2` → `seller-2`.
pub fn test_app(base: &str, free_quota: u32) -> TestApp {
    let mut config = BrokerConfig::default();
    config.database.path = ":memory:".to_string();
    config.server.public_base_url = "https://broker.test".to_string();
    config.server.integrations_ui_url = UI_URL.to_string();
    config.rate_limit.tiers.free = Quota::new(free_quota, 60);
    config.sync.batch_size = 2;
    config.sync.retry_backoff_ms = 1;
    config.webhooks.max_attempts = 2;
    config.webhooks.backoff_ms = 1;
    config.webhooks.timeout_secs = 2;
    config.oauth.http_timeout_secs = 5;
    config
        .sessions
        .tokens
        .insert("sess-1".to_string(), "seller-1".to_string());
    config
        .sessions
        .tokens
        .insert("sess-2".to_string(), "seller-2".to_string());

    let mut clients = HashMap::new();
    clients.insert(
        "shipbob".to_string(),
        OAuthClient {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
        },
    );

    let components = Components::build(
        config,
        Arc::new(CredentialVault::new(&BASE64.encode([42u8; 32])).unwrap()),
        Arc::new(ProviderRegistry::from_toml_str(&providers_toml(base)).unwrap()),
        OAuthClients::fixed(clients),
        Arc::new(TracingSink),
    )
    .unwrap();
    let router = create_router(AppState::from_components(&components));

    TestApp { router, components }
}

pub async fn send(app: &TestApp, request: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(request).await.unwrap()
}

pub fn get(uri: &str, session: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", session))
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, session: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {}", session))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn location(response: &Response<Body>) -> String {
    response.headers()["location"].to_str().unwrap().to_string()
}

/// Value of `name` in a URL's query string (percent-decoded).
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| urlencoding::decode(v).unwrap().into_owned())
    })
}
