//! API keys for the external `/api/v1` façade.
//!
//! A key authenticates a seller's machine client; every use is metered by the
//! rate limiter against the seller's subscription tier.

mod store;

pub use store::ApiKeyStore;

use crate::error::{BrokerError, BrokerResult};
use crate::rate_limit::{RateLimiter, SubscriptionDirectory, TierQuotas, WindowDecision};
use crate::vault::{CredentialVault, Sealed};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// The fixed permission taxonomy.
pub const PERMISSIONS: &[&str] = &[
    "products:read",
    "products:write",
    "orders:read",
    "orders:write",
    "inventory:read",
    "inventory:write",
    "integrations:read",
    "integrations:write",
    "sync:read",
    "sync:write",
    "webhooks:write",
];

const KEY_PREFIX: &str = "mk_";

#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    /// Opaque value presented in `X-Api-Key`.
    pub key: String,
    pub secret: Sealed,
    pub permissions: Vec<String>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub seller_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Listing view; never includes the secret or the full key.
#[derive(Clone, Debug, Serialize)]
pub struct ApiKeyView {
    pub id: String,
    pub name: String,
    pub key_prefix: String,
    pub permissions: Vec<String>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&ApiKeyRecord> for ApiKeyView {
    fn from(r: &ApiKeyRecord) -> Self {
        Self {
            id: r.id.clone(),
            name: r.name.clone(),
            key_prefix: r.key.chars().take(KEY_PREFIX.len() + 6).collect(),
            permissions: r.permissions.clone(),
            active: r.active,
            expires_at: r.expires_at,
            created_at: r.created_at,
            last_used_at: r.last_used_at,
        }
    }
}

/// Returned once from [`ApiKeyService::create`]; the plaintext secret is not retrievable later.
#[derive(Debug)]
pub struct IssuedApiKey {
    pub record: ApiKeyRecord,
    pub secret: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenyReason {
    UnknownKey,
    Inactive,
    Expired,
    QuotaExceeded { retry_after: Duration },
    MissingPermission { permission: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allow { remaining: u32 },
    Deny(DenyReason),
}

/// A key that passed [`ApiKeyService::authorize`].
#[derive(Clone, Debug)]
pub struct KeyGrant {
    pub key_id: String,
    pub seller_id: String,
    pub remaining: u32,
}

pub struct ApiKeyService {
    store: ApiKeyStore,
    vault: Arc<CredentialVault>,
    limiter: RateLimiter,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    quotas: TierQuotas,
}

impl ApiKeyService {
    pub fn new(
        store: ApiKeyStore,
        vault: Arc<CredentialVault>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        quotas: TierQuotas,
    ) -> Self {
        Self {
            store,
            vault,
            limiter: RateLimiter::new(),
            subscriptions,
            quotas,
        }
    }

    /// Issues a new active key for `seller_id`.
    pub fn create(
        &self,
        seller_id: &str,
        name: &str,
        permissions: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> BrokerResult<IssuedApiKey> {
        if name.trim().is_empty() {
            return Err(BrokerError::InvalidInput("API key name is required".into()));
        }
        if permissions.is_empty() {
            return Err(BrokerError::InvalidInput(
                "at least one permission is required".into(),
            ));
        }
        if let Some(unknown) = permissions.iter().find(|p| !PERMISSIONS.contains(&p.as_str())) {
            return Err(BrokerError::InvalidInput(format!(
                "unknown permission '{}'",
                unknown
            )));
        }
        if matches!(expires_at, Some(exp) if exp <= Utc::now()) {
            return Err(BrokerError::InvalidInput(
                "expires_at must be in the future".into(),
            ));
        }

        let mut permissions = permissions;
        permissions.sort();
        permissions.dedup();

        let secret = random_token(48);
        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            key: format!("{}{}", KEY_PREFIX, random_token(32)),
            secret: self.vault.encrypt(&secret)?,
            permissions,
            active: true,
            expires_at,
            seller_id: seller_id.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.store.insert(&record)?;

        tracing::info!(
            seller_id = %seller_id,
            key_id = %record.id,
            permissions = ?record.permissions,
            "API key issued"
        );

        Ok(IssuedApiKey { record, secret })
    }

    pub fn deactivate(&self, seller_id: &str, key_id: &str) -> BrokerResult<()> {
        if !self.store.set_active(seller_id, key_id, false)? {
            return Err(BrokerError::NotFound(format!("API key {}", key_id)));
        }
        tracing::info!(seller_id = %seller_id, key_id = %key_id, "API key deactivated");
        Ok(())
    }

    pub fn list(&self, seller_id: &str) -> BrokerResult<Vec<ApiKeyRecord>> {
        Ok(self.store.list_by_seller(seller_id)?)
    }

    /// Meters one request for `key`. Inactive, expired and unknown keys are
    /// denied without touching the quota.
    pub fn check(&self, key: &str) -> BrokerResult<RateDecision> {
        Ok(match self.meter(key)? {
            Ok((_, remaining)) => RateDecision::Allow { remaining },
            Err(reason) => RateDecision::Deny(reason),
        })
    }

    /// [`check`](Self::check) plus a permission check; a missing permission is
    /// rejected before any quota is consumed.
    pub fn authorize(
        &self,
        key: &str,
        permission: &str,
    ) -> BrokerResult<Result<KeyGrant, DenyReason>> {
        if let Some(record) = self.store.get_by_key(key)? {
            if record.active
                && !record.is_expired_at(Utc::now())
                && !record.has_permission(permission)
            {
                return Ok(Err(DenyReason::MissingPermission {
                    permission: permission.to_string(),
                }));
            }
        }

        Ok(self.meter(key)?.map(|(record, remaining)| KeyGrant {
            key_id: record.id,
            seller_id: record.seller_id,
            remaining,
        }))
    }

    fn meter(&self, key: &str) -> BrokerResult<Result<(ApiKeyRecord, u32), DenyReason>> {
        let record = match self.store.get_by_key(key)? {
            Some(record) => record,
            None => return Ok(Err(DenyReason::UnknownKey)),
        };
        if !record.active {
            return Ok(Err(DenyReason::Inactive));
        }
        let now = Utc::now();
        if record.is_expired_at(now) {
            return Ok(Err(DenyReason::Expired));
        }

        let tier = self.subscriptions.tier_for(&record.seller_id);
        let quota = self.quotas.quota(tier);

        match self.limiter.check_and_record(&record.id, quota) {
            WindowDecision::Allowed { remaining } => {
                self.store.touch(&record.id, now)?;
                Ok(Ok((record, remaining)))
            }
            WindowDecision::Limited { retry_after } => {
                tracing::debug!(
                    key_id = %record.id,
                    seller_id = %record.seller_id,
                    tier = ?tier,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "API key over quota"
                );
                Ok(Err(DenyReason::QuotaExceeded { retry_after }))
            }
        }
    }

    /// Background task dropping idle limiter windows.
    pub async fn run_limiter_cleanup(self: Arc<Self>, interval_secs: u64) {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        let max_window = [
            self.quotas.free,
            self.quotas.basic,
            self.quotas.pro,
            self.quotas.enterprise,
        ]
        .iter()
        .map(|q| q.window())
        .max()
        .unwrap_or(Duration::from_secs(60));

        loop {
            interval.tick().await;
            self.limiter.prune_idle(max_window);
            tracing::debug!(
                "Rate limiter cleanup complete, {} keys tracked",
                self.limiter.tracked_keys()
            );
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{Quota, StaticSubscriptions, Tier};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use std::collections::HashMap;

    fn service_with_free_quota(requests: u32) -> ApiKeyService {
        let vault = Arc::new(CredentialVault::new(&BASE64.encode([9u8; 32])).unwrap());
        let quotas = TierQuotas {
            free: Quota::new(requests, 60),
            ..TierQuotas::default()
        };
        ApiKeyService::new(
            ApiKeyStore::new(":memory:").unwrap(),
            vault,
            Arc::new(StaticSubscriptions::new(Tier::Free, HashMap::new())),
            quotas,
        )
    }

    fn perms(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_create_returns_secret_once_and_seals_it() {
        let service = service_with_free_quota(10);
        let issued = service
            .create("s1", "ci", perms(&["products:read"]), None)
            .unwrap();

        assert!(issued.record.key.starts_with("mk_"));
        assert!(issued.record.active);
        assert_ne!(issued.record.secret.as_str(), issued.secret);
        assert_eq!(service.vault.decrypt(&issued.record.secret).unwrap(), issued.secret);
    }

    #[test]
    fn test_create_rejects_unknown_permission() {
        let service = service_with_free_quota(10);
        let err = service
            .create("s1", "ci", perms(&["products:read", "admin:all"]), None)
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidInput(msg) if msg.contains("admin:all")));
    }

    #[test]
    fn test_quota_n_then_denied() {
        let service = service_with_free_quota(3);
        let key = service
            .create("s1", "ci", perms(&["orders:read"]), None)
            .unwrap()
            .record
            .key;

        for _ in 0..3 {
            assert!(matches!(
                service.check(&key).unwrap(),
                RateDecision::Allow { .. }
            ));
        }
        match service.check(&key).unwrap() {
            RateDecision::Deny(DenyReason::QuotaExceeded { retry_after }) => {
                assert!(retry_after > Duration::ZERO)
            }
            other => panic!("expected quota denial, got {:?}", other),
        }
    }

    #[test]
    fn test_inactive_key_denied_without_consuming_quota() {
        let service = service_with_free_quota(1);
        let issued = service
            .create("s1", "ci", perms(&["orders:read"]), None)
            .unwrap();

        service.deactivate("s1", &issued.record.id).unwrap();
        for _ in 0..3 {
            assert_eq!(
                service.check(&issued.record.key).unwrap(),
                RateDecision::Deny(DenyReason::Inactive)
            );
        }
        assert_eq!(service.limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_unknown_key_denied() {
        let service = service_with_free_quota(1);
        assert_eq!(
            service.check("mk_nope").unwrap(),
            RateDecision::Deny(DenyReason::UnknownKey)
        );
    }

    #[test]
    fn test_authorize_checks_permission_first() {
        let service = service_with_free_quota(1);
        let key = service
            .create("s1", "ci", perms(&["sync:read"]), None)
            .unwrap()
            .record
            .key;

        let denied = service.authorize(&key, "integrations:write").unwrap();
        assert_eq!(
            denied.unwrap_err(),
            DenyReason::MissingPermission {
                permission: "integrations:write".into()
            }
        );

        // The forbidden attempt did not use the single request in the window
        let grant = service.authorize(&key, "sync:read").unwrap().unwrap();
        assert_eq!(grant.seller_id, "s1");
        assert_eq!(grant.remaining, 0);
    }

    #[test]
    fn test_deactivate_other_sellers_key_is_not_found() {
        let service = service_with_free_quota(1);
        let issued = service
            .create("s1", "ci", perms(&["sync:read"]), None)
            .unwrap();
        assert!(matches!(
            service.deactivate("s2", &issued.record.id),
            Err(BrokerError::NotFound(_))
        ));
    }

    #[test]
    fn test_view_hides_secret_material() {
        let service = service_with_free_quota(1);
        let issued = service
            .create("s1", "ci", perms(&["sync:read"]), None)
            .unwrap();
        let json = serde_json::to_string(&ApiKeyView::from(&issued.record)).unwrap();
        assert!(!json.contains(&issued.secret));
        assert!(!json.contains(&issued.record.key));
    }
}
