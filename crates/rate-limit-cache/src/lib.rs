//! TTL response cache with stale-on-rate-limit fallback, and a per-endpoint
//! rate-limit blackout gate. One instance of each lives per broker adapter
//! — caches are never shared across adapters or bots.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::hash::Hash;

struct CacheEntry<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// `cache[key] = (value, expires_at)`. `get` returns `None` once
/// expired; `get_stale` ignores expiry entirely so a rate-limited caller can
/// still serve the last known value, labeled stale by the caller.
pub struct TtlCache<K, T> {
    entries: DashMap<K, CacheEntry<T>>,
}

impl<K, T> Default for TtlCache<K, T>
where
K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, T> TtlCache<K, T>
where
K: Eq + Hash + Clone,
T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: K, value: T, ttl: chrono::Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Utc::now() + ttl,
            },
        );
    }

    /// Fresh read: `None` if missing or expired.
    pub fn get(&self, key: &K) -> Option<T> {
        self.entries.get(key).and_then(|e| {
            if e.expires_at > Utc::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    /// Stale read: returns the last stored value regardless of expiry, for
    /// the `RateLimited` degrade-gracefully path.
    pub fn get_stale(&self, key: &K) -> Option<T> {
        self.entries.get(key).map(|e| e.value.clone())
    }
}

/// A single `blocked_until` instant per endpoint class e.g.
/// `"account_info"`, `"positions"`, `"prices"`, `"orders"`. A background
/// re-enable job is just `is_blocked` returning `false` once the instant
/// passes — no separate timer task is required.
#[derive(Default)]
pub struct RateLimitGate {
    blocked_until: DashMap<String, DateTime<Utc>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self, class: &str) -> bool {
        self.blocked_until
            .get(class)
            .map(|until| *until > Utc::now())
            .unwrap_or(false)
    }

    /// Sets the blackout for `class` until `until`. If already blocked
    /// further out than `until`, the longer blackout wins.
    pub fn block_until(&self, class: &str, until: DateTime<Utc>) {
        self.blocked_until
            .entry(class.to_string())
            .and_modify(|existing| {
            if until > *existing {
                *existing = until;
            }
        })
            .or_insert(until);
        tracing::warn!(class, until = %until, "rate limit blackout set");
    }

    pub fn block_for(&self, class: &str, duration: chrono::Duration) {
        self.block_until(class, Utc::now() + duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ttl_cache_expires() {
        let cache: TtlCache<String, i32> = TtlCache::new();
        cache.set("k".to_string(), 42, Duration::seconds(-1));
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(cache.get_stale(&"k".to_string()), Some(42));
    }

    #[test]
    fn ttl_cache_fresh_hit() {
        let cache: TtlCache<String, i32> = TtlCache::new();
        cache.set("k".to_string(), 7, Duration::seconds(30));
        assert_eq!(cache.get(&"k".to_string()), Some(7));
    }

    #[test]
    fn gate_blocks_until_instant_passes() {
        let gate = RateLimitGate::new();
        assert!(!gate.is_blocked("account_info"));
        gate.block_for("account_info", Duration::seconds(30));
        assert!(gate.is_blocked("account_info"));
        gate.block_until("account_info", Utc::now() - Duration::seconds(1));
        // A later, earlier `block_until` must not shorten an active blackout.
        assert!(gate.is_blocked("account_info"));
    }

    #[test]
    fn gate_classes_are_independent() {
        let gate = RateLimitGate::new();
        gate.block_for("prices", Duration::seconds(30));
        assert!(gate.is_blocked("prices"));
        assert!(!gate.is_blocked("orders"));
    }
}
