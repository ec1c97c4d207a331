//! OAuth state management for CSRF protection.
//!
//! Each authorize redirect carries a random single-use state token bound to
//! the seller, provider and environment that started the flow.

use crate::integration::Environment;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Correlation record behind a state token.
#[derive(Clone, Debug)]
pub struct OAuthState {
    pub seller_id: String,
    pub provider: String,
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
}

/// In-memory state store with automatic expiration.
pub struct OAuthStateStore {
    states: Mutex<HashMap<String, OAuthState>>,
    ttl: Duration,
}

impl OAuthStateStore {
    /// # Arguments
    /// * `ttl_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    /// Generates and stores a new state token.
    pub fn issue(&self, seller_id: &str, provider: &str, environment: Environment) -> String {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let state = OAuthState {
            seller_id: seller_id.to_string(),
            provider: provider.to_string(),
            environment,
            created_at: Utc::now(),
        };

        self.states.lock().unwrap().insert(token.clone(), state);
        token
    }

    /// Validates and consumes a state token.
    ///
    /// Removal and validation happen under one lock, so of two concurrent
    /// callers at most one gets the state. A token presented for another
    /// provider or environment is burned as well: the flow fails closed.
    pub fn consume(
        &self,
        token: &str,
        provider: &str,
        environment: Environment,
    ) -> Option<OAuthState> {
        let state = self.states.lock().unwrap().remove(token)?;

        if Utc::now() - state.created_at > self.ttl {
            return None;
        }
        if state.provider != provider || state.environment != environment {
            tracing::warn!(
                provider = %provider,
                environment = %environment,
                "OAuth state presented for a different provider or environment"
            );
            return None;
        }

        Some(state)
    }

    /// Drops expired states (called periodically).
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.states
            .lock()
            .unwrap()
            .retain(|_, state| now - state.created_at <= self.ttl);
    }

    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(store: Arc<OAuthStateStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        store.cleanup_expired();
        tracing::debug!("OAuth state cleanup complete, {} states remaining", store.count());
    }
}
