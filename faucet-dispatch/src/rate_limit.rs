//! Key/TTL stores backing the ingress rate limits.
//!
//! [`SqliteRateLimitStore`] keeps limits in the record store so they hold
//! across processes (every `faucetctl enqueue` is its own process).
//! [`MemoryRateLimitStore`] suits a single long-lived host.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::Db;

pub trait RateLimitStore: Send + Sync {
    /// True if `key` is present and not expired.
    fn get(&self, key: &str) -> Result<bool, String>;

    /// Mark `key` present for `ttl`.
    fn set(&self, key: &str, ttl: Duration) -> Result<(), String>;
}

/// Rate limits persisted in the `rate_limits` table.
pub struct SqliteRateLimitStore {
    db: Arc<Db>,
}

impl SqliteRateLimitStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Expiry timestamp `ttl` after `now`, saturating for absurd TTLs.
fn expires_at(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

impl RateLimitStore for SqliteRateLimitStore {
    fn get(&self, key: &str) -> Result<bool, String> {
        self.db.rate_limit_active(key, unix_now())
    }

    fn set(&self, key: &str, ttl: Duration) -> Result<(), String> {
        let now = unix_now();
        let purged = self.db.purge_rate_limits(now)?;
        if purged > 0 {
            log::debug!("[INGRESS] Purged {} expired rate limits", purged);
        }
        self.db.set_rate_limit(key, expires_at(now, ttl))
    }
}

/// In-process store. Expired entries are swept on every write.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    /// `None` never expires (TTL beyond what `Instant` can represent)
    entries: DashMap<String, Option<Instant>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_live(expires_at: &Option<Instant>, now: Instant) -> bool {
    expires_at.is_none_or(|at| at > now)
}

impl RateLimitStore for MemoryRateLimitStore {
    fn get(&self, key: &str) -> Result<bool, String> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| is_live(entry.value(), now)))
    }

    fn set(&self, key: &str, ttl: Duration) -> Result<(), String> {
        let now = Instant::now();
        self.entries.retain(|_, expires_at| is_live(expires_at, now));
        self.entries.insert(key.to_string(), now.checked_add(ttl));
        Ok(())
    }
}
