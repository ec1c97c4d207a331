//! Recent delivery outcomes, kept in memory for observability.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// One webhook delivery, after all of its attempts.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub seller_id: String,
    pub event: String,
    pub url: String,
    pub payload: Value,
    pub signature: String,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
    pub at: DateTime<Utc>,
}

/// Bounded by age and by count, oldest entries evicted first.
pub struct DeliveryLog {
    entries: Mutex<VecDeque<WebhookDelivery>>,
    retention: Duration,
    max_entries: usize,
}

impl DeliveryLog {
    pub fn new(retention_secs: u64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retention: Duration::seconds(retention_secs as i64),
            max_entries,
        }
    }

    pub fn record(&self, delivery: WebhookDelivery) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(delivery);
        self.evict(&mut entries);
    }

    /// Deliveries for one seller, newest first.
    pub fn recent(&self, seller_id: &str) -> Vec<WebhookDelivery> {
        let mut entries = self.entries.lock().unwrap();
        self.evict(&mut entries);
        entries
            .iter()
            .rev()
            .filter(|d| d.seller_id == seller_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, entries: &mut VecDeque<WebhookDelivery>) {
        let cutoff = Utc::now() - self.retention;
        while entries
            .front()
            .map_or(false, |d| d.at < cutoff || entries.len() > self.max_entries)
        {
            entries.pop_front();
        }
    }
}
