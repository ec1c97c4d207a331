//! Per-integration inventory sync scheduler.

use broker::error::{BrokerError, BrokerResult};
use broker::integration::IntegrationKey;
use broker::oauth::OAuthConnectionManager;
use broker::sync::{SyncJob, SyncKind, SyncRunner};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Status information for one scheduler.
#[derive(Clone, Debug, Default)]
pub struct SchedulerStatus {
    /// Last successful run
    pub last_run: Option<DateTime<Utc>>,
    pub last_job_id: Option<String>,
    /// Job currently being driven by this scheduler
    pub current_job: Option<String>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub error_count: u64,
}

/// Runs an inventory sync for one integration on a fixed interval.
///
/// Each tick:
/// - reloads the integration and stops short if it is no longer connected
/// - refreshes the OAuth access token when it is about to expire
/// - starts an inventory job, or adopts the one already running
pub struct SyncScheduler {
    key: IntegrationKey,
    connections: Arc<OAuthConnectionManager>,
    sync: Arc<SyncRunner>,
    interval: Duration,
    status: Arc<Mutex<SchedulerStatus>>,
}

impl SyncScheduler {
    pub fn new(
        key: IntegrationKey,
        connections: Arc<OAuthConnectionManager>,
        sync: Arc<SyncRunner>,
        interval: Duration,
    ) -> Self {
        Self {
            key,
            connections,
            sync,
            interval,
            status: Arc::new(Mutex::new(SchedulerStatus::default())),
        }
    }

    pub fn key(&self) -> &IntegrationKey {
        &self.key
    }

    /// Returns a clone of the status tracker for external monitoring.
    pub fn status(&self) -> Arc<Mutex<SchedulerStatus>> {
        Arc::clone(&self.status)
    }

    /// One scheduled run.
    pub async fn tick(&self) -> BrokerResult<SyncJob> {
        let integration = self
            .connections
            .integrations()
            .get(&self.key)?
            .filter(|i| i.is_connected())
            .ok_or_else(|| BrokerError::NotConnected {
                provider: self.key.provider.clone(),
                environment: self.key.environment.to_string(),
            })?;

        // Refresh before the job exists; a failed refresh records no job
        self.connections.ensure_fresh(&integration).await?;

        let started = self
            .sync
            .tracker()
            .start(&self.key, SyncKind::Inventory, None)?;
        if !started.created {
            debug!(
                integration = %self.key,
                job_id = %started.job.id,
                "Inventory sync already running, skipping"
            );
            return Ok(started.job);
        }

        let job = started.job;
        self.status.lock().await.current_job = Some(job.id.clone());
        let result = self.sync.run(&job).await;
        self.status.lock().await.current_job = None;
        result
    }

    /// Starts the scheduling loop (non-blocking). The first run happens
    /// immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                integration = %self.key,
                interval_secs = self.interval.as_secs(),
                "Starting sync scheduler"
            );

            let mut ticker = interval(self.interval);
            // Runs after a long sync are delayed, never bunched
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                debug!(integration = %self.key, "Scheduled inventory sync");

                match self.tick().await {
                    Ok(job) => {
                        let mut status = self.status.lock().await;
                        status.last_run = Some(Utc::now());
                        status.last_job_id = Some(job.id);
                        status.last_error = None;
                        status.run_count += 1;
                    }
                    Err(e) => {
                        error!(
                            integration = %self.key,
                            code = e.code(),
                            error = %e,
                            "Scheduled inventory sync failed"
                        );
                        let mut status = self.status.lock().await;
                        status.last_error = Some(e.to_string());
                        status.error_count += 1;
                    }
                }
            }
        })
    }
}
