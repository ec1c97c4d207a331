// Integration tests for the OAuth connect flow over HTTP

mod common;

use axum::http::StatusCode;
use common::*;
use mockito::{Matcher, Server};
use serde_json::json;

async fn authorize_state(app: &TestApp, environment: &str) -> String {
    let response = send(
        app,
        get(
            &format!("/api/integrations/shipbob/{}/oauth/authorize", environment),
            "sess-1",
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    query_param(&location(&response), "state").unwrap()
}

fn callback_uri(environment: &str, code: &str, state: &str) -> String {
    format!(
        "/api/integrations/shipbob/{}/oauth/callback?code={}&state={}",
        environment, code, state
    )
}

#[tokio::test]
async fn test_authorize_requires_session() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let response = send(&app, get("/api/integrations/shipbob/sandbox/oauth/authorize", "nope")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_authorize_redirects_to_provider() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let response = send(&app, get("/api/integrations/shipbob/sandbox/oauth/authorize", "sess-1")).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let url = location(&response);
    assert!(url.starts_with("https://auth.shipbob.test/authorize?"));
    assert_eq!(query_param(&url, "client_id").as_deref(), Some("cid"));
    assert_eq!(
        query_param(&url, "redirect_uri").as_deref(),
        Some("https://broker.test/api/integrations/shipbob/sandbox/oauth/callback")
    );
    assert!(query_param(&url, "state").is_some());
}

#[tokio::test]
async fn test_authorize_rejects_non_oauth_provider() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let response = send(&app, get("/api/integrations/printful/live/oauth/authorize", "sess-1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "unsupported_provider");
}

#[tokio::test]
async fn test_callback_connects_and_reused_state_fails() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let token = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "ABC".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let state = authorize_state(&app, "sandbox").await;

    let first = send(&app, get(&callback_uri("sandbox", "ABC", &state), "")).await;
    assert_eq!(first.status(), StatusCode::TEMPORARY_REDIRECT);
    let landing = location(&first);
    assert!(landing.starts_with(UI_URL));
    assert_eq!(query_param(&landing, "status").as_deref(), Some("connected"));
    assert_eq!(query_param(&landing, "environment").as_deref(), Some("sandbox"));

    let second = send(&app, get(&callback_uri("sandbox", "ABC", &state), "")).await;
    assert_eq!(
        query_param(&location(&second), "error").as_deref(),
        Some("invalid_state")
    );
    token.assert_async().await;

    let listed = json_body(send(&app, get("/api/integrations", "sess-1")).await).await;
    let integrations = listed["integrations"].as_array().unwrap();
    assert_eq!(integrations.len(), 1);
    assert_eq!(integrations[0]["provider"], "shipbob");
    assert_eq!(integrations[0]["environment"], "sandbox");
    assert_eq!(integrations[0]["status"], "connected");
    // Tokens never leave the broker
    assert!(!listed.to_string().contains("at-1"));
}

#[tokio::test]
async fn test_sandbox_and_live_are_isolated() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _token = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-1","expires_in":3600}"#)
        .create_async()
        .await;

    // A sandbox state cannot finish a live connection
    let state = authorize_state(&app, "sandbox").await;
    let response = send(&app, get(&callback_uri("live", "ABC", &state), "")).await;
    assert_eq!(
        query_param(&location(&response), "error").as_deref(),
        Some("invalid_state")
    );

    let state = authorize_state(&app, "live").await;
    send(&app, get(&callback_uri("live", "ABC", &state), "")).await;

    let listed = json_body(send(&app, get("/api/integrations", "sess-1")).await).await;
    let integrations = listed["integrations"].as_array().unwrap();
    assert_eq!(integrations.len(), 1);
    assert_eq!(integrations[0]["environment"], "live");
}

#[tokio::test]
async fn test_failed_exchange_redirects_with_error_code() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _token = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let state = authorize_state(&app, "sandbox").await;
    let response = send(&app, get(&callback_uri("sandbox", "bad", &state), "")).await;
    assert_eq!(
        query_param(&location(&response), "error").as_deref(),
        Some("token_exchange_failed")
    );

    let listed = json_body(send(&app, get("/api/integrations", "sess-1")).await).await;
    assert!(listed["integrations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_provider_denial_redirects_with_error_code() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let state = authorize_state(&app, "sandbox").await;
    let uri = format!(
        "/api/integrations/shipbob/sandbox/oauth/callback?error=access_denied&state={}",
        state
    );
    let response = send(&app, get(&uri, "")).await;
    assert_eq!(
        query_param(&location(&response), "error").as_deref(),
        Some("token_exchange_failed")
    );
}

#[tokio::test]
async fn test_direct_connect_and_disconnect() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let probe = server
        .mock("GET", "/pf/store")
        .match_header("x-api-token", "pk_live_1")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let response = send(
        &app,
        post_json(
            "/api/integrations/printful/live/connect",
            "sess-1",
            json!({"credentials": {"api_key": "pk_live_1"}}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let connected = json_body(response).await;
    assert_eq!(connected["status"], "connected");
    assert_eq!(connected["credential_fields"], json!(["api_key"]));
    assert!(!connected.to_string().contains("pk_live_1"));
    probe.assert_async().await;

    for _ in 0..2 {
        let response = send(
            &app,
            post_json("/api/integrations/printful/live/disconnect", "sess-1", json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let listed = json_body(send(&app, get("/api/integrations", "sess-1")).await).await;
    let integration = &listed["integrations"][0];
    assert_eq!(integration["status"], "disconnected");
    assert_eq!(integration["credential_fields"], json!([]));
    // History survives the disconnect
    assert!(integration["history"].as_array().unwrap().len() >= 3);
}

#[tokio::test]
async fn test_connect_rejects_unknown_fields() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let response = send(
        &app,
        post_json(
            "/api/integrations/printful/live/connect",
            "sess-1",
            json!({"credentials": {"api_key": "k", "password": "p"}}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "invalid_input");
}
