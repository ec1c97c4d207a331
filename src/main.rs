use anyhow::{Context, Result};
use broker::api::{create_router, AppState};
use broker::components::Components;
use broker::config::{load_config_or_default, RuntimeEnv};
use broker::oauth::{run_state_cleanup, OAuthClients};
use broker::providers::ProviderRegistry;
use broker::sync::{run_job_cleanup, TracingSink};
use broker::vault::CredentialVault;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

const LIMITER_CLEANUP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broker=info".into()),
        )
        .init();

    info!("Integration broker starting...");

    let config_path =
        std::env::var("BROKER_CONFIG").unwrap_or_else(|_| "broker.toml".to_string());
    let mut config = load_config_or_default(&config_path)?;
    let runtime = RuntimeEnv::from_env()?;
    runtime.apply(&mut config);

    info!(
        config = %config_path,
        bind_addr = %config.server.bind_addr,
        public_base_url = %config.server.public_base_url,
        database = %config.database.path,
        "Configuration loaded"
    );

    let vault = Arc::new(
        CredentialVault::new(&runtime.encryption_key)
            .context("Failed to initialize credential vault")?,
    );
    let registry = Arc::new(
        ProviderRegistry::load(&config.providers.descriptor_path)
            .context("Failed to load provider descriptors")?,
    );
    info!(providers = registry.len(), "Provider descriptors loaded");

    let components = Components::build(
        config,
        vault,
        registry,
        OAuthClients::from_env(),
        Arc::new(TracingSink),
    )?;
    let config = components.config.clone();

    // Background housekeeping
    tokio::spawn(run_state_cleanup(
        components.states.clone(),
        config.oauth.state_cleanup_interval_secs,
    ));
    tokio::spawn(run_job_cleanup(
        components.tracker.clone(),
        config.sync.job_cleanup_interval_secs,
        config.sync.job_retention_secs,
    ));
    tokio::spawn(
        components
            .api_keys
            .clone()
            .run_limiter_cleanup(LIMITER_CLEANUP_INTERVAL_SECS),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(AppState::from_components(&components)).layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "Broker API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Broker API server error")?;

    info!("Integration broker stopped");
    Ok(())
}
