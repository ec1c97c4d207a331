pub mod runtime;
pub use runtime::RuntimeEnv;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// Re-export component-owned config types
pub use crate::rate_limit::RateLimitConfig;

/// Complete broker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Base URL providers redirect back to; `BROKER_PUBLIC_URL` overrides it.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Seller-facing integrations screen the OAuth callback redirects to.
    #[serde(default = "default_integrations_ui_url")]
    pub integrations_ui_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_integrations_ui_url() -> String {
    "http://localhost:5173/integrations".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: default_public_base_url(),
            integrations_ui_url: default_integrations_ui_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file shared by the broker and the sync worker.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "broker.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How long an authorize state stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_secs: u64,
    /// Refresh proactively when the access token expires within this margin
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    /// Timeout for every provider call, token endpoints included
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_state_ttl() -> u64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

fn default_refresh_margin() -> u64 {
    90
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_state_ttl(),
            state_cleanup_interval_secs: default_state_cleanup_interval(),
            refresh_margin_secs: default_refresh_margin(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_descriptor_path")]
    pub descriptor_path: String,
}

fn default_descriptor_path() -> String {
    "providers.toml".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            descriptor_path: default_descriptor_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Records requested per batch (`page_size`)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Retries of a batch that failed with a provider outage
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Worker: how often to look for newly connected integrations
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    /// Worker: time between inventory syncs of one integration
    #[serde(default = "default_run_interval")]
    pub run_interval_secs: u64,
    /// Finished jobs older than this are purged
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,
    #[serde(default = "default_job_cleanup_interval")]
    pub job_cleanup_interval_secs: u64,
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_batch_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_run_interval() -> u64 {
    900
}

fn default_job_retention() -> u64 {
    86_400
}

fn default_job_cleanup_interval() -> u64 {
    3_600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_retries: default_max_batch_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            discovery_interval_secs: default_discovery_interval(),
            run_interval_secs: default_run_interval(),
            job_retention_secs: default_job_retention(),
            job_cleanup_interval_secs: default_job_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Per-attempt delivery timeout
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

fn default_retention() -> u64 {
    3_600
}

fn default_max_retained() -> usize {
    1_000
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            retention_secs: default_retention(),
            max_retained: default_max_retained(),
        }
    }
}

/// Seller session resolution for the seller-facing routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Treat the bearer token itself as the seller id (development only).
    #[serde(default)]
    pub passthrough: bool,
    /// Session token → seller id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::info!("Config file {} not found, using defaults", path.display());
        return Ok(BrokerConfig::default());
    }
    load_config(path)
}
