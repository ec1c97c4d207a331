//! Inventory and order synchronization.
//!
//! A job pulls records from a provider page by page through the integration
//! service, hands each batch to a [`SyncSink`] and records progress in the
//! [`SyncProgressTracker`]. Cancellation is cooperative: the runner checks
//! the job between batches, never in the middle of a provider call.

mod runner;
mod tracker;

pub use runner::{SyncRunner, SyncSettings};
pub use tracker::{run_job_cleanup, JobStart, SyncProgressTracker};

use crate::integration::{Environment, IntegrationKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Inventory,
    Orders,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Inventory => "inventory",
            SyncKind::Orders => "orders",
        }
    }

    /// Descriptor operation that pages through this kind of record.
    pub fn operation(&self) -> &'static str {
        match self {
            SyncKind::Inventory => "searchProducts",
            SyncKind::Orders => "syncOrders",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inventory" => Ok(SyncKind::Inventory),
            "orders" => Ok(SyncKind::Orders),
            other => Err(format!("unknown sync kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SyncStatus::Running),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            "cancelled" => Some(SyncStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

/// One sync run. `processed` only ever grows; terminal states are final.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: String,
    pub seller_id: String,
    pub provider: String,
    pub environment: Environment,
    pub kind: SyncKind,
    pub processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn key(&self) -> IntegrationKey {
        IntegrationKey::new(&self.seller_id, &self.provider, self.environment)
    }
}

/// Normalized records bound for the marketplace's own product/order tables.
#[derive(Debug)]
pub struct RecordBatch<'a> {
    pub key: &'a IntegrationKey,
    pub kind: SyncKind,
    /// Set for batches pulled by a sync job; `None` for inbound webhooks.
    pub job_id: Option<&'a str>,
    pub records: &'a [Value],
}

/// Persistence collaborator for synced records.
#[async_trait]
pub trait SyncSink: Send + Sync {
    async fn apply(&self, batch: RecordBatch<'_>) -> anyhow::Result<()>;
}

/// Sink that only logs what it receives.
pub struct TracingSink;

#[async_trait]
impl SyncSink for TracingSink {
    async fn apply(&self, batch: RecordBatch<'_>) -> anyhow::Result<()> {
        tracing::info!(
            seller_id = %batch.key.seller_id,
            provider = %batch.key.provider,
            environment = %batch.key.environment,
            kind = %batch.kind,
            job_id = batch.job_id.unwrap_or("-"),
            records = batch.records.len(),
            "Received record batch"
        );
        Ok(())
    }
}
