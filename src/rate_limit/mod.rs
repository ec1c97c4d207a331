// Rate limiting for API-key authenticated requests.
//
// Sliding-window log per key. The window for a key lives behind its DashMap
// entry lock, so pruning, the capacity check and recording the request are one
// atomic step: concurrent callers can never push a key past its quota.
// State is in-memory only (resets on restart).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Request budget: at most `requests` calls in any `window_secs` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub requests: u32,
    pub window_secs: u64,
}

impl Quota {
    pub const fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Subscription plans that select a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierQuotas {
    #[serde(default = "default_free")]
    pub free: Quota,
    #[serde(default = "default_basic")]
    pub basic: Quota,
    #[serde(default = "default_pro")]
    pub pro: Quota,
    #[serde(default = "default_enterprise")]
    pub enterprise: Quota,
}

fn default_free() -> Quota {
    Quota::new(60, 60)
}

fn default_basic() -> Quota {
    Quota::new(300, 60)
}

fn default_pro() -> Quota {
    Quota::new(1_200, 60)
}

fn default_enterprise() -> Quota {
    Quota::new(6_000, 60)
}

impl Default for TierQuotas {
    fn default() -> Self {
        Self {
            free: default_free(),
            basic: default_basic(),
            pro: default_pro(),
            enterprise: default_enterprise(),
        }
    }
}

impl TierQuotas {
    pub fn quota(&self, tier: Tier) -> Quota {
        match tier {
            Tier::Free => self.free,
            Tier::Basic => self.basic,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// `[rate_limit]` section of the broker config.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_tier")]
    pub default_tier: Tier,
    #[serde(default)]
    pub tiers: TierQuotas,
    /// seller id → tier, for the config-backed subscription directory.
    #[serde(default)]
    pub sellers: HashMap<String, Tier>,
}

fn default_tier() -> Tier {
    Tier::Free
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier(),
            tiers: TierQuotas::default(),
            sellers: HashMap::new(),
        }
    }
}

/// Seller → subscription tier lookup. The subscription system itself is external.
pub trait SubscriptionDirectory: Send + Sync {
    fn tier_for(&self, seller_id: &str) -> Tier;
}

/// Tier table taken from `[rate_limit.sellers]`.
pub struct StaticSubscriptions {
    default_tier: Tier,
    sellers: HashMap<String, Tier>,
}

impl StaticSubscriptions {
    pub fn new(default_tier: Tier, sellers: HashMap<String, Tier>) -> Self {
        Self {
            default_tier,
            sellers,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.default_tier, config.sellers.clone())
    }
}

impl SubscriptionDirectory for StaticSubscriptions {
    fn tier_for(&self, seller_id: &str) -> Tier {
        self.sellers
            .get(seller_id)
            .copied()
            .unwrap_or(self.default_tier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Allowed { remaining: u32 },
    /// `retry_after` is the time until the oldest request leaves the window.
    Limited { retry_after: Duration },
}

/// Per-key sliding-window log limiter.
///
/// Windows are created lazily on the first request for a key.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Records one request for `key` if the quota has room.
    pub fn check_and_record(&self, key: &str, quota: Quota) -> WindowDecision {
        self.check_and_record_at(key, quota, Instant::now())
    }

    fn check_and_record_at(&self, key: &str, quota: Quota, now: Instant) -> WindowDecision {
        let window = quota.window();
        if quota.requests == 0 {
            return WindowDecision::Limited {
                retry_after: window,
            };
        }

        let mut log = self.windows.entry(key.to_string()).or_default();

        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= window {
                log.pop_front();
            } else {
                break;
            }
        }

        if (log.len() as u32) < quota.requests {
            log.push_back(now);
            WindowDecision::Allowed {
                remaining: quota.requests - log.len() as u32,
            }
        } else {
            // Window is full, so the log is non-empty
            let oldest = log.front().copied().unwrap_or(now);
            let retry_after = window
                .saturating_sub(now.saturating_duration_since(oldest))
                .max(Duration::from_millis(1));
            WindowDecision::Limited { retry_after }
        }
    }

    /// Drops every window whose newest request is older than `max_window`.
    pub fn prune_idle(&self, max_window: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, log| {
            log.back()
                .map(|newest| now.saturating_duration_since(*newest) < max_window)
                .unwrap_or(false)
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allows_exactly_quota() {
        let limiter = RateLimiter::new();
        let quota = Quota::new(3, 60);

        for expected_remaining in [2, 1, 0] {
            assert_eq!(
                limiter.check_and_record("key1", quota),
                WindowDecision::Allowed {
                    remaining: expected_remaining
                }
            );
        }

        match limiter.check_and_record("key1", quota) {
            WindowDecision::Limited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected Limited, got {:?}", other),
        }
    }

    #[test]
    fn test_separate_windows_per_key() {
        let limiter = RateLimiter::new();
        let quota = Quota::new(1, 60);
        assert!(matches!(
            limiter.check_and_record("a", quota),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_and_record("a", quota),
            WindowDecision::Limited { .. }
        ));
        // b is unaffected
        assert!(matches!(
            limiter.check_and_record("b", quota),
            WindowDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new();
        let quota = Quota::new(2, 10);
        let t0 = Instant::now();

        assert!(matches!(
            limiter.check_and_record_at("k", quota, t0),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_and_record_at("k", quota, t0 + Duration::from_secs(4)),
            WindowDecision::Allowed { .. }
        ));

        // Full until the first request is 10s old
        assert_eq!(
            limiter.check_and_record_at("k", quota, t0 + Duration::from_secs(6)),
            WindowDecision::Limited {
                retry_after: Duration::from_secs(4)
            }
        );

        assert!(matches!(
            limiter.check_and_record_at("k", quota, t0 + Duration::from_secs(10)),
            WindowDecision::Allowed { remaining: 0 }
        ));
    }

    #[test]
    fn test_denied_requests_do_not_consume() {
        let limiter = RateLimiter::new();
        let quota = Quota::new(1, 10);
        let t0 = Instant::now();

        limiter.check_and_record_at("k", quota, t0);
        for i in 1..5 {
            limiter.check_and_record_at("k", quota, t0 + Duration::from_secs(i));
        }
        // Only the first request occupies the window
        assert!(matches!(
            limiter.check_and_record_at("k", quota, t0 + Duration::from_secs(10)),
            WindowDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_concurrent_callers_never_exceed_quota() {
        let limiter = Arc::new(RateLimiter::new());
        let quota = Quota::new(50, 60);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| {
                            matches!(
                                limiter.check_and_record("shared", quota),
                                WindowDecision::Allowed { .. }
                            )
                        })
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_zero_quota_denies() {
        let limiter = RateLimiter::new();
        assert_eq!(
            limiter.check_and_record("k", Quota::new(0, 30)),
            WindowDecision::Limited {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_static_subscriptions() {
        let mut sellers = HashMap::new();
        sellers.insert("big-seller".to_string(), Tier::Enterprise);
        let directory = StaticSubscriptions::new(Tier::Free, sellers);

        assert_eq!(directory.tier_for("big-seller"), Tier::Enterprise);
        assert_eq!(directory.tier_for("someone-else"), Tier::Free);
    }

    #[test]
    fn test_tier_config_parse() {
        let config: RateLimitConfig = toml::from_str(
            r#"
            default_tier = "basic"
            [tiers.pro]
            requests = 5
            window_secs = 1
            [sellers]
            acme = "pro"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_tier, Tier::Basic);
        assert_eq!(config.tiers.quota(Tier::Pro), Quota::new(5, 1));
        assert_eq!(config.tiers.quota(Tier::Free), Quota::new(60, 60));
        assert_eq!(config.sellers["acme"], Tier::Pro);
    }
}
