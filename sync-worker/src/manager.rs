//! Sync worker manager - one scheduler per connected integration.
//!
//! A discovery cycle reconciles the running schedulers with the integrations
//! table: new connections get a scheduler, disconnected ones lose theirs, and
//! schedulers whose last run failed are restarted.

use crate::scheduler::{SchedulerStatus, SyncScheduler};
use anyhow::{Context, Result};
use broker::components::Components;
use broker::config::SyncConfig;
use broker::integration::{ConnectionStatus, IntegrationKey};
use broker::oauth::OAuthConnectionManager;
use broker::sync::{SyncKind, SyncRunner};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub discovery_interval: Duration,
    pub run_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            discovery_interval: Duration::from_secs(config.discovery_interval_secs),
            run_interval: Duration::from_secs(config.run_interval_secs),
        }
    }
}

/// What one discovery cycle changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub started: usize,
    pub stopped: usize,
    pub restarted: usize,
}

struct ScheduledSync {
    key: IntegrationKey,
    status: Arc<Mutex<SchedulerStatus>>,
    handle: JoinHandle<()>,
}

/// State shared between the manager and its discovery loop.
#[derive(Clone)]
struct Discovery {
    connections: Arc<OAuthConnectionManager>,
    sync: Arc<SyncRunner>,
    run_interval: Duration,
    /// Keyed by integration id
    schedulers: Arc<Mutex<HashMap<String, ScheduledSync>>>,
}

pub struct SyncWorkerManager {
    discovery: Discovery,
    discovery_interval: Duration,
    discovery_handle: Option<JoinHandle<()>>,
}

impl SyncWorkerManager {
    pub fn new(
        connections: Arc<OAuthConnectionManager>,
        sync: Arc<SyncRunner>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            discovery: Discovery {
                connections,
                sync,
                run_interval: settings.run_interval,
                schedulers: Arc::new(Mutex::new(HashMap::new())),
            },
            discovery_interval: settings.discovery_interval,
            discovery_handle: None,
        }
    }

    pub fn from_components(components: &Components) -> Self {
        Self::new(
            components.connections.clone(),
            components.sync.clone(),
            WorkerSettings::from_config(&components.config.sync),
        )
    }

    /// Runs an initial discovery cycle, then keeps discovering in the background.
    pub async fn start(&mut self) -> Result<DiscoveryReport> {
        info!("Starting sync worker manager");
        let report = self.discovery.run_cycle().await?;

        let discovery = self.discovery.clone();
        let period = self.discovery_interval;
        self.discovery_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await; // initial cycle already ran

            loop {
                interval.tick().await;
                if let Err(e) = discovery.run_cycle().await {
                    warn!(error = %e, "Discovery cycle failed");
                }
            }
        }));

        Ok(report)
    }

    /// Runs one discovery cycle now.
    pub async fn run_discovery_cycle(&self) -> Result<DiscoveryReport> {
        self.discovery.run_cycle().await
    }

    /// Snapshot of every scheduler's status, keyed by integration id.
    pub async fn statuses(&self) -> HashMap<String, SchedulerStatus> {
        let schedulers = self.discovery.schedulers.lock().await;
        let mut out = HashMap::with_capacity(schedulers.len());
        for (id, scheduled) in schedulers.iter() {
            out.insert(id.clone(), scheduled.status.lock().await.clone());
        }
        out
    }

    /// Stops discovery and every scheduler. Jobs cut off mid-run are
    /// cancelled so they do not stay `running`.
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync worker manager");

        if let Some(handle) = self.discovery_handle.take() {
            handle.abort();
        }

        let mut schedulers = self.discovery.schedulers.lock().await;
        let count = schedulers.len();
        for (_, scheduled) in schedulers.drain() {
            self.discovery.stop(scheduled).await;
        }
        info!(scheduler_count = count, "All sync schedulers stopped");
    }
}

impl Drop for SyncWorkerManager {
    fn drop(&mut self) {
        if let Some(handle) = self.discovery_handle.take() {
            handle.abort();
        }
        // Best effort; Drop cannot await the lock
        if let Ok(mut schedulers) = self.discovery.schedulers.try_lock() {
            for (_, scheduled) in schedulers.drain() {
                scheduled.handle.abort();
            }
        }
    }
}

impl Discovery {
    /// Reconciles schedulers with the integrations table:
    /// 1. stop schedulers whose integration is gone or no longer connected
    /// 2. restart idle schedulers whose last run failed
    /// 3. start schedulers for newly connected integrations
    async fn run_cycle(&self) -> Result<DiscoveryReport> {
        let registry = self.connections.registry();
        let operation = SyncKind::Inventory.operation();

        let eligible: HashMap<String, IntegrationKey> = self
            .connections
            .integrations()
            .list_by_status(ConnectionStatus::Connected)
            .context("Failed to list connected integrations")?
            .into_iter()
            .filter(|i| {
                registry
                    .get(&i.provider)
                    .map_or(false, |d| d.supports(operation))
            })
            .map(|i| (i.id.clone(), i.key()))
            .collect();

        let mut report = DiscoveryReport::default();
        let mut schedulers = self.schedulers.lock().await;

        let gone: Vec<String> = schedulers
            .keys()
            .filter(|id| !eligible.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(scheduled) = schedulers.remove(&id) {
                info!(integration_id = %id, integration = %scheduled.key, "Discovery: stopped scheduler (integration no longer connected)");
                self.stop(scheduled).await;
                report.stopped += 1;
            }
        }

        let mut errored = Vec::new();
        for (id, scheduled) in schedulers.iter() {
            let status = scheduled.status.lock().await;
            if status.last_error.is_some() && status.current_job.is_none() {
                errored.push(id.clone());
            }
        }
        for id in errored {
            if let Some(old) = schedulers.remove(&id) {
                old.handle.abort();
                info!(integration_id = %id, integration = %old.key, "Discovery: restarted errored scheduler");
                schedulers.insert(id, self.spawn(old.key));
                report.restarted += 1;
            }
        }

        for (id, key) in eligible {
            if schedulers.contains_key(&id) {
                continue;
            }
            info!(integration_id = %id, integration = %key, "Discovery: started scheduler");
            schedulers.insert(id, self.spawn(key));
            report.started += 1;
        }

        Ok(report)
    }

    fn spawn(&self, key: IntegrationKey) -> ScheduledSync {
        let scheduler = SyncScheduler::new(
            key.clone(),
            self.connections.clone(),
            self.sync.clone(),
            self.run_interval,
        );
        let status = scheduler.status();
        let handle = scheduler.start();
        ScheduledSync {
            key,
            status,
            handle,
        }
    }

    async fn stop(&self, scheduled: ScheduledSync) {
        scheduled.handle.abort();

        let Some(job_id) = scheduled.status.lock().await.current_job.clone() else {
            return;
        };
        match self.sync.tracker().cancel(&job_id) {
            Ok(_) => info!(job_id = %job_id, integration = %scheduled.key, "Cancelled interrupted sync job"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to cancel interrupted sync job"),
        }
    }
}
