use anyhow::{Context, Result};
use broker::components::Components;
use broker::config::{load_config_or_default, RuntimeEnv};
use broker::oauth::OAuthClients;
use broker::providers::ProviderRegistry;
use broker::sync::{run_job_cleanup, TracingSink};
use broker::vault::CredentialVault;
use std::sync::Arc;
use sync_worker::SyncWorkerManager;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_worker=info,broker=info".into()),
        )
        .init();

    info!("Sync worker starting...");

    let config_path =
        std::env::var("BROKER_CONFIG").unwrap_or_else(|_| "broker.toml".to_string());
    let mut config = load_config_or_default(&config_path)?;
    let runtime = RuntimeEnv::from_env()?;
    runtime.apply(&mut config);

    info!(
        config = %config_path,
        database = %config.database.path,
        discovery_interval_secs = config.sync.discovery_interval_secs,
        run_interval_secs = config.sync.run_interval_secs,
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

    let components = Components::build(
        config,
        vault,
        registry,
        OAuthClients::from_env(),
        Arc::new(TracingSink),
    )?;

    let cleanup = tokio::spawn(run_job_cleanup(
        components.tracker.clone(),
        components.config.sync.job_cleanup_interval_secs,
        components.config.sync.job_retention_secs,
    ));

    let mut manager = SyncWorkerManager::from_components(&components);
    let report = manager.start().await?;
    info!(schedulers_started = report.started, "Sync worker manager started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    cleanup.abort();
    manager.shutdown().await;
    info!("Sync worker stopped");

    Ok(())
}
