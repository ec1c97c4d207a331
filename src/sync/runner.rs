//! The batch loop behind a sync job.

use super::{JobStart, RecordBatch, SyncJob, SyncKind, SyncProgressTracker, SyncSink, SyncStatus};
use crate::config::SyncConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::integration::IntegrationKey;
use crate::service::GenericIntegrationService;
use crate::webhooks::WebhookDispatcher;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: u32,
    pub max_batch_retries: u32,
    pub retry_backoff: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_batch_retries: config.max_batch_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

pub struct SyncRunner {
    service: Arc<GenericIntegrationService>,
    tracker: Arc<SyncProgressTracker>,
    sink: Arc<dyn SyncSink>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    settings: SyncSettings,
}

impl SyncRunner {
    pub fn new(
        service: Arc<GenericIntegrationService>,
        tracker: Arc<SyncProgressTracker>,
        sink: Arc<dyn SyncSink>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            service,
            tracker,
            sink,
            webhooks: None,
            settings,
        }
    }

    /// Announce finished jobs as `sync.completed` webhooks.
    pub fn with_webhooks(mut self, dispatcher: Arc<WebhookDispatcher>) -> Self {
        self.webhooks = Some(dispatcher);
        self
    }

    pub fn tracker(&self) -> &Arc<SyncProgressTracker> {
        &self.tracker
    }

    /// Creates a job and runs it on a background task. A job of the same kind
    /// already running for the integration is returned instead; poll the
    /// tracker for progress.
    pub fn start(self: &Arc<Self>, key: &IntegrationKey, kind: SyncKind) -> BrokerResult<JobStart> {
        let connections = self.service.connections();
        let integration = connections
            .integrations()
            .get(key)?
            .filter(|i| i.is_connected())
            .ok_or_else(|| BrokerError::NotConnected {
                provider: key.provider.clone(),
                environment: key.environment.to_string(),
            })?;
        let descriptor = connections
            .registry()
            .get(&key.provider)
            .ok_or_else(|| BrokerError::UnsupportedProvider(key.provider.clone()))?;
        if !descriptor.supports(kind.operation()) {
            return Err(BrokerError::UnsupportedOperation {
                provider: key.provider.clone(),
                operation: kind.operation().to_string(),
            });
        }

        let started = self.tracker.start(key, kind, None)?;
        if !started.created {
            return Ok(started);
        }
        info!(
            job_id = %started.job.id,
            integration_id = %integration.id,
            kind = %kind,
            "Sync job started"
        );

        let runner = Arc::clone(self);
        let spawned = started.job.clone();
        tokio::spawn(async move {
            // Outcome is recorded on the job itself
            let _ = runner.run(&spawned).await;
        });

        Ok(started)
    }

    /// Runs a job created by the tracker to completion, failure or cancellation.
    /// The job is never left `running` when this returns.
    pub async fn run(&self, job: &SyncJob) -> BrokerResult<SyncJob> {
        let result = self.drive(job).await;
        if let Err(e) = &result {
            // No-op unless an early exit skipped the terminal write
            match self.tracker.fail(&job.id, &e.to_string()) {
                Ok(true) => warn!(job_id = %job.id, error = %e, "Sync job aborted"),
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "Failed to settle aborted sync job"),
            }
        }
        result
    }

    async fn drive(&self, job: &SyncJob) -> BrokerResult<SyncJob> {
        let key = job.key();
        let operation = job.kind.operation();
        let page_size = self.settings.batch_size;
        let mut page: u64 = 1;

        loop {
            if self.tracker.is_cancelled(&job.id)? {
                return Err(self.cancelled(job));
            }

            let records = match self.fetch_batch(&key, operation, page, page_size).await {
                Ok(records) => records,
                Err(e) => return Err(self.failed(job, &e.to_string())),
            };

            if !records.is_empty() {
                let batch = RecordBatch {
                    key: &key,
                    kind: job.kind,
                    job_id: Some(&job.id),
                    records: &records,
                };
                if let Err(e) = self.sink.apply(batch).await {
                    return Err(self.failed(job, &format!("storing batch {} failed: {:#}", page, e)));
                }
            }

            if !self.tracker.advance(&job.id, records.len() as u64)? {
                // Cancelled while the batch was in flight
                return Err(self.cancelled(job));
            }

            if records.len() < page_size as usize {
                break;
            }
            page += 1;
        }

        if !self.tracker.complete(&job.id)? {
            return Err(self.cancelled(job));
        }

        let finished = self
            .tracker
            .get(&job.id)?
            .ok_or_else(|| BrokerError::NotFound(format!("sync job {}", job.id)))?;
        info!(
            job_id = %job.id,
            provider = %job.provider,
            processed = finished.processed,
            "Sync job completed"
        );

        if let Some(dispatcher) = &self.webhooks {
            dispatcher.dispatch_detached(
                &job.seller_id,
                "sync.completed",
                json!({
                    "job_id": finished.id,
                    "provider": finished.provider,
                    "environment": finished.environment,
                    "kind": finished.kind,
                    "processed": finished.processed,
                }),
            );
        }
        Ok(finished)
    }

    /// One page, retried with exponential backoff while the provider is unavailable.
    async fn fetch_batch(
        &self,
        key: &IntegrationKey,
        operation: &str,
        page: u64,
        page_size: u32,
    ) -> BrokerResult<Vec<Value>> {
        let mut params = Map::new();
        params.insert("page".to_string(), json!(page));
        params.insert("page_size".to_string(), json!(page_size));

        let mut retries = 0;
        loop {
            match self.service.call(key, operation, &params).await {
                Ok(response) => return Ok(response.records),
                Err(BrokerError::ProviderUnavailable { message, .. })
                    if retries < self.settings.max_batch_retries =>
                {
                    let backoff = self.settings.retry_backoff * 2u32.saturating_pow(retries);
                    warn!(
                        provider = %key.provider,
                        operation = %operation,
                        page = page,
                        retry = retries + 1,
                        error = %message,
                        "Batch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn failed(&self, job: &SyncJob, message: &str) -> BrokerError {
        warn!(job_id = %job.id, provider = %job.provider, error = %message, "Sync job failed");
        if let Err(e) = self.tracker.fail(&job.id, message) {
            warn!(job_id = %job.id, error = %e, "Failed to record sync failure");
        }
        // A cancel that landed first wins
        match self.tracker.get(&job.id) {
            Ok(Some(current)) if current.status == SyncStatus::Cancelled => BrokerError::SyncCancelled,
            _ => BrokerError::SyncFailed(message.to_string()),
        }
    }

    fn cancelled(&self, job: &SyncJob) -> BrokerError {
        info!(job_id = %job.id, provider = %job.provider, "Sync job cancelled");
        BrokerError::SyncCancelled
    }
}
