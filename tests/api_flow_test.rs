// Integration tests for sync jobs, webhooks and the API-key façade over HTTP

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use broker::webhooks::sign;
use common::*;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};
use std::time::Duration;

async fn connect_printful(app: &TestApp, server: &mut ServerGuard, session: &str) -> (Mock, Value) {
    let probe = server
        .mock("GET", "/pf/store")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let response = send(
        app,
        post_json(
            "/api/integrations/printful/live/connect",
            session,
            json!({"credentials": {"api_key": "pk_live_1"}}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    (probe, json_body(response).await)
}

async fn issue_key(app: &TestApp, permissions: Value) -> String {
    let response = send(
        app,
        post_json(
            "/api/keys",
            "sess-1",
            json!({"name": "storefront", "permissions": permissions}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    body["key"].as_str().unwrap().to_string()
}

fn with_key(method: &str, uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", key)
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap()
}

async fn wait_for_job(app: &TestApp, job_id: &str, status: &str) -> Value {
    let uri = format!("/api/sync/jobs/{}", job_id);
    for _ in 0..200 {
        let job = json_body(send(app, get(&uri, "sess-1")).await).await;
        if job["status"] == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", job_id, status);
}

#[tokio::test]
async fn test_sync_runs_to_completion() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _probe = connect_printful(&app, &mut server, "sess-1").await;
    let _page1 = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
        .with_status(200)
        .with_body(r#"{"result":[{"id":1,"stock":"4"},{"id":2,"stock":7}]}"#)
        .create_async()
        .await;
    let _page2 = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
        .with_status(200)
        .with_body(r#"{"result":[{"id":3,"stock":1}]}"#)
        .create_async()
        .await;

    let response = send(
        &app,
        post_json("/api/integrations/printful/live/sync", "sess-1", json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let started = json_body(response).await;
    assert_eq!(started["kind"], "inventory");
    assert_eq!(started["already_running"], false);

    let job = wait_for_job(&app, started["job_id"].as_str().unwrap(), "completed").await;
    assert_eq!(job["processed"], 3);
}

#[tokio::test]
async fn test_sync_requires_connection() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let response = send(
        &app,
        post_json("/api/integrations/printful/live/sync", "sess-1", json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "not_connected");
}

#[tokio::test]
async fn test_sync_cancel_and_ownership() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _probe = connect_printful(&app, &mut server, "sess-1").await;
    // Always a full page, so the job pages until cancelled
    let _products = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"result":[{"id":1},{"id":2}]}"#)
        .create_async()
        .await;

    let started = json_body(
        send(
            &app,
            post_json("/api/integrations/printful/live/sync", "sess-1", json!({})),
        )
        .await,
    )
    .await;
    let job_id = started["job_id"].as_str().unwrap().to_string();

    // A second request while running hands back the same job
    let again = json_body(
        send(
            &app,
            post_json("/api/integrations/printful/live/sync", "sess-1", json!({})),
        )
        .await,
    )
    .await;
    assert_eq!(again["job_id"], job_id.as_str());
    assert_eq!(again["already_running"], true);

    // Another seller cannot see or cancel it
    let foreign = send(&app, get(&format!("/api/sync/jobs/{}", job_id), "sess-2")).await;
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    let foreign_cancel = send(
        &app,
        post_json(&format!("/api/sync/jobs/{}/cancel", job_id), "sess-2", json!({})),
    )
    .await;
    assert_eq!(foreign_cancel.status(), StatusCode::NOT_FOUND);

    let cancelled = send(
        &app,
        post_json(&format!("/api/sync/jobs/{}/cancel", job_id), "sess-1", json!({})),
    )
    .await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(json_body(cancelled).await["status"], "cancelled");

    let job = wait_for_job(&app, &job_id, "cancelled").await;
    let processed = job["processed"].as_u64().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = wait_for_job(&app, &job_id, "cancelled").await;
    assert_eq!(later["processed"].as_u64().unwrap(), processed);

    let active = json_body(send(&app, get("/api/sync/jobs", "sess-1")).await).await;
    assert!(active["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_receiver_does_not_fail_sync() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _probe = connect_printful(&app, &mut server, "sess-1").await;
    let _products = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"result":[{"id":1}]}"#)
        .create_async()
        .await;
    let receiver = server
        .mock("POST", "/hooks")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;

    let registered = send(
        &app,
        post_json(
            "/api/webhooks/endpoints",
            "sess-1",
            json!({"url": format!("{}/hooks", server.url()), "events": ["sync.*"]}),
        ),
    )
    .await;
    assert_eq!(registered.status(), StatusCode::CREATED);
    assert!(json_body(registered).await["secret"]
        .as_str()
        .unwrap()
        .starts_with("whsec_"));

    let started = json_body(
        send(
            &app,
            post_json("/api/integrations/printful/live/sync", "sess-1", json!({})),
        )
        .await,
    )
    .await;
    wait_for_job(&app, started["job_id"].as_str().unwrap(), "completed").await;

    let mut deliveries = Value::Null;
    for _ in 0..200 {
        deliveries = json_body(send(&app, get("/api/webhooks/deliveries", "sess-1")).await).await;
        if !deliveries["deliveries"].as_array().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let delivery = &deliveries["deliveries"][0];
    assert_eq!(delivery["event"], "sync.completed");
    assert_eq!(delivery["attempts"], 2);
    assert_eq!(delivery["outcome"]["result"], "failed");
    receiver.assert_async().await;
}

#[tokio::test]
async fn test_deactivated_endpoint_is_listed_inactive() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let registered = json_body(
        send(
            &app,
            post_json(
                "/api/webhooks/endpoints",
                "sess-1",
                json!({"url": "https://hooks.test/in", "events": ["*"]}),
            ),
        )
        .await,
    )
    .await;
    let id = registered["endpoint"]["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/webhooks/endpoints/{}", id))
        .header("authorization", "Bearer sess-2")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/webhooks/endpoints/{}", id))
        .header("authorization", "Bearer sess-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::NO_CONTENT);

    let listed = json_body(send(&app, get("/api/webhooks/endpoints", "sess-1")).await).await;
    assert_eq!(listed["endpoints"][0]["active"], false);
    assert!(!listed.to_string().contains("whsec_"));
}

#[tokio::test]
async fn test_inbound_webhook_signature() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let (_probe, connected) = connect_printful(&app, &mut server, "sess-1").await;
    let integration_id = connected["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("PUT")
        .uri("/api/integrations/printful/live/webhook")
        .header("authorization", "Bearer sess-1")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"enabled": true, "url": "https://hooks.test/printful"}).to_string(),
        ))
        .unwrap();
    let configured = json_body(send(&app, request).await).await;
    assert_eq!(configured["integration"]["webhook_enabled"], true);
    let secret = configured["secret"].as_str().unwrap().to_string();

    let ingest = |body: &str, signature: String| {
        Request::builder()
            .method("POST")
            .uri(format!("/api/webhooks/ingest/{}", integration_id))
            .header("x-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let body = r#"{"event":"inventory.updated","data":[{"id":1,"stock":3}]}"#;
    let response = send(&app, ingest(body, sign(&secret, body.as_bytes()))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "handled");

    let body = r#"{"event":"product.deleted","data":{"id":1}}"#;
    let response = send(&app, ingest(body, format!("sha256={}", sign(&secret, body.as_bytes())))).await;
    assert_eq!(json_body(response).await["status"], "ignored");

    let response = send(&app, ingest(body, sign("whsec_wrong", body.as_bytes()))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "invalid_signature");

    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/ingest/does-not-exist")
        .header("x-signature", "00")
        .body(Body::from(body))
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_v1_requires_valid_key_and_permission() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);

    let response = send(&app, with_key("GET", "/api/v1/integrations", "")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, with_key("GET", "/api/v1/integrations", "mk_unknown")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let key = issue_key(&app, json!(["sync:read"])).await;
    let response = send(&app, with_key("GET", "/api/v1/integrations", &key)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let key = issue_key(&app, json!(["integrations:read"])).await;
    let response = send(&app, with_key("GET", "/api/v1/integrations", &key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
}

#[tokio::test]
async fn test_v1_quota_exhaustion_returns_retry_after() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 3);
    let key = issue_key(&app, json!(["integrations:read"])).await;

    for _ in 0..3 {
        let response = send(&app, with_key("GET", "/api/v1/integrations", &key)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&app, with_key("GET", "/api/v1/integrations", &key)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
    assert_eq!(json_body(response).await["code"], "quota_exceeded");
}

#[tokio::test]
async fn test_v1_deactivated_key_is_forbidden() {
    let server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let key = issue_key(&app, json!(["integrations:read"])).await;

    let keys = json_body(send(&app, get("/api/keys", "sess-1")).await).await;
    let id = keys["keys"][0]["id"].as_str().unwrap().to_string();
    assert!(!keys.to_string().contains(&key));

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/keys/{}", id))
        .header("authorization", "Bearer sess-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::NO_CONTENT);

    let response = send(&app, with_key("GET", "/api/v1/integrations", &key)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_v1_call_maps_provider_outage() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _probe = connect_printful(&app, &mut server, "sess-1").await;
    let outage = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let key = issue_key(&app, json!(["integrations:write"])).await;

    let response = send(
        &app,
        with_key(
            "POST",
            "/api/v1/integrations/printful/live/call/searchProducts",
            &key,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], "provider_unavailable");
    outage.assert_async().await;

    let response = send(
        &app,
        with_key("POST", "/api/v1/integrations/printful/live/call/createLabel", &key),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "unsupported_operation");
}

#[tokio::test]
async fn test_v1_call_normalizes_records() {
    let mut server = Server::new_async().await;
    let app = test_app(&server.url(), 10);
    let _probe = connect_printful(&app, &mut server, "sess-1").await;
    let _products = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::Any)
        .match_header("x-api-token", "pk_live_1")
        .with_status(200)
        .with_body(r#"{"result":[{"id":9,"stock":"12"}]}"#)
        .create_async()
        .await;
    let key = issue_key(&app, json!(["integrations:write"])).await;

    let response = send(
        &app,
        with_key(
            "POST",
            "/api/v1/integrations/printful/live/call/searchProducts",
            &key,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["provider"], "printful");
    assert_eq!(body["records"][0]["quantity"], 12);
}

#[test]
fn test_sample_descriptors_load() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/providers.toml");
    let registry = broker::providers::ProviderRegistry::load(path).unwrap();
    assert!(registry.get("shipbob").is_some());
    assert!(registry.get("printful").is_some());
}
