// Integration tests for the sync worker: scheduler ticks and discovery

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use broker::components::Components;
use broker::config::BrokerConfig;
use broker::integration::{Environment, IntegrationKey};
use broker::oauth::{CallbackParams, OAuthClient, OAuthClients};
use broker::providers::ProviderRegistry;
use broker::sync::{SyncJob, SyncKind, SyncStatus, TracingSink};
use broker::vault::CredentialVault;
use mockito::{Matcher, Server, ServerGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use sync_worker::{DiscoveryReport, SyncScheduler, SyncWorkerManager, WorkerSettings};

fn providers_toml(base: &str) -> String {
    format!(
        r#"
        [[providers]]
        name = "shipbob"
        category = "warehouse"
        auth_mode = "oauth2"

        [providers.oauth]
        authorize_url = "https://auth.shipbob.test/authorize"
        token_url = "{base}/token"

        [providers.base_url]
        sandbox = "{base}/sandbox"
        live = "{base}/live"

        [providers.operations.searchProducts]
        method = "GET"
        path = "/products"
        query = {{ page = "{{page}}" }}

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

        [providers.operations.searchProducts]
        method = "GET"
        path = "/products"
        query = {{ page = "{{page}}" }}
        items_path = "/result"

        [[providers]]
        name = "ledger"
        category = "accounting"
        auth_mode = "api_key"
        credential_fields = ["api_key"]

        [[providers.auth]]
        location = "header"
        name = "X-Ledger-Key"
        field = "api_key"

        [providers.base_url]
        sandbox = "{base}/ledger"
        live = "{base}/ledger"

        [providers.operations.calculateTax]
        method = "POST"
        path = "/tax"
        "#,
        base = base
    )
}

fn components(base: &str) -> Components {
    let mut config = BrokerConfig::default();
    config.database.path = ":memory:".to_string();
    config.server.public_base_url = "https://broker.test".to_string();
    config.sync.batch_size = 10;
    config.sync.retry_backoff_ms = 1;
    config.sync.discovery_interval_secs = 3600;
    config.sync.run_interval_secs = 3600;

    let mut clients = HashMap::new();
    clients.insert(
        "shipbob".to_string(),
        OAuthClient {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
        },
    );

    Components::build(
        config,
        Arc::new(CredentialVault::new(&BASE64.encode([7u8; 32])).unwrap()),
        Arc::new(ProviderRegistry::from_toml_str(&providers_toml(base)).unwrap()),
        OAuthClients::fixed(clients),
        Arc::new(TracingSink),
    )
    .unwrap()
}

fn key(provider: &str, environment: Environment) -> IntegrationKey {
    IntegrationKey::new("seller-1", provider, environment)
}

async fn connect_api_key(components: &Components, provider: &str) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("api_key".to_string(), "k-1".to_string());
    components
        .connections
        .connect_with_credentials(&key(provider, Environment::Live), fields)
        .await
        .unwrap()
        .id
}

async fn products_mock(server: &mut ServerGuard, path: &str) -> mockito::Mock {
    server
        .mock("GET", path)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"result":[{"id":1},{"id":2}]}"#)
        .create_async()
        .await
}

fn scheduler(components: &Components, key: IntegrationKey) -> SyncScheduler {
    SyncScheduler::new(
        key,
        components.connections.clone(),
        components.sync.clone(),
        Duration::from_secs(3600),
    )
}

async fn wait_for_finished_job(components: &Components) -> SyncJob {
    for _ in 0..200 {
        let jobs = components.tracker.list_for_seller("seller-1", 10).unwrap();
        if let Some(job) = jobs.into_iter().find(|j| j.status.is_terminal()) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no sync job finished");
}

#[tokio::test]
async fn test_tick_runs_inventory_sync() {
    let mut server = Server::new_async().await;
    let components = components(&server.url());
    let _products = products_mock(&mut server, "/pf/products").await;
    connect_api_key(&components, "printful").await;

    let job = scheduler(&components, key("printful", Environment::Live))
        .tick()
        .await
        .unwrap();
    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.processed, 2);
}

#[tokio::test]
async fn test_tick_adopts_job_started_elsewhere() {
    let mut server = Server::new_async().await;
    let components = components(&server.url());
    let products = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    connect_api_key(&components, "printful").await;

    let running = components
        .tracker
        .start(&key("printful", Environment::Live), SyncKind::Inventory, None)
        .unwrap()
        .job;

    let job = scheduler(&components, key("printful", Environment::Live))
        .tick()
        .await
        .unwrap();
    assert_eq!(job.id, running.id);
    assert_eq!(job.status, SyncStatus::Running);
    assert_eq!(components.tracker.list_active("seller-1").unwrap().len(), 1);
    products.assert_async().await;
}

#[tokio::test]
async fn test_tick_requires_connected_integration() {
    let server = Server::new_async().await;
    let components = components(&server.url());

    let err = scheduler(&components, key("printful", Environment::Live))
        .tick()
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_connected");
    assert!(components
        .tracker
        .list_for_seller("seller-1", 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_tick_refreshes_expiring_token_first() {
    let mut server = Server::new_async().await;
    let components = components(&server.url());
    let _exchange = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "authorization_code".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-old","refresh_token":"rt-1","expires_in":30}"#)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-new","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let products = server
        .mock("GET", "/sandbox/products")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer at-new")
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let state = components
        .states
        .issue("seller-1", "shipbob", Environment::Sandbox);
    components
        .connections
        .handle_callback(
            "shipbob",
            Environment::Sandbox,
            &CallbackParams {
                code: Some("c-1".to_string()),
                state: Some(state),
                error: None,
                error_description: None,
            },
        )
        .await
        .unwrap();

    let job = scheduler(&components, key("shipbob", Environment::Sandbox))
        .tick()
        .await
        .unwrap();
    assert_eq!(job.status, SyncStatus::Completed);
    refresh.assert_async().await;
    products.assert_async().await;

    let stored = components
        .integrations
        .get(&key("shipbob", Environment::Sandbox))
        .unwrap()
        .unwrap();
    // The original refresh token is kept when the provider does not rotate it
    assert!(stored.tokens.unwrap().refresh_token.is_some());
}

#[tokio::test]
async fn test_discovery_starts_and_stops_schedulers() {
    let mut server = Server::new_async().await;
    let components = components(&server.url());
    let _products = products_mock(&mut server, "/pf/products").await;
    let integration_id = connect_api_key(&components, "printful").await;
    // No searchProducts operation, so never scheduled
    connect_api_key(&components, "ledger").await;

    let manager = SyncWorkerManager::from_components(&components);
    let report = manager.run_discovery_cycle().await.unwrap();
    assert_eq!(
        report,
        DiscoveryReport {
            started: 1,
            stopped: 0,
            restarted: 0
        }
    );
    assert!(manager.statuses().await.contains_key(&integration_id));

    let job = wait_for_finished_job(&components).await;
    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.provider, "printful");

    // Nothing changed
    assert_eq!(
        manager.run_discovery_cycle().await.unwrap(),
        DiscoveryReport::default()
    );

    components
        .connections
        .disconnect(&key("printful", Environment::Live))
        .await
        .unwrap();
    let report = manager.run_discovery_cycle().await.unwrap();
    assert_eq!(report.stopped, 1);
    assert!(manager.statuses().await.is_empty());
}

#[tokio::test]
async fn test_discovery_restarts_failed_scheduler() {
    let mut server = Server::new_async().await;
    let components = components(&server.url());
    let _probe_failure = server
        .mock("GET", "/pf/products")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(r#"{"error":"not found"}"#)
        .create_async()
        .await;
    let integration_id = connect_api_key(&components, "printful").await;

    let manager = SyncWorkerManager::new(
        components.connections.clone(),
        components.sync.clone(),
        WorkerSettings {
            discovery_interval: Duration::from_secs(3600),
            run_interval: Duration::from_secs(3600),
        },
    );
    manager.run_discovery_cycle().await.unwrap();

    let mut failed = false;
    for _ in 0..200 {
        let statuses = manager.statuses().await;
        if statuses[&integration_id].last_error.is_some() {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed);

    let report = manager.run_discovery_cycle().await.unwrap();
    assert_eq!(report.restarted, 1);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let mut server = Server::new_async().await;
    let components = components(&server.url());
    let _products = products_mock(&mut server, "/pf/products").await;
    connect_api_key(&components, "printful").await;

    let mut manager = SyncWorkerManager::from_components(&components);
    let report = manager.start().await.unwrap();
    assert_eq!(report.started, 1);

    manager.shutdown().await;
    assert!(manager.statuses().await.is_empty());
    assert!(components
        .tracker
        .list_active("seller-1")
        .unwrap()
        .is_empty());
}
