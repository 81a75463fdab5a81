pub mod keyed_lock;
pub mod memory;
pub mod redis;
pub mod sqlite;

use crate::error::Result;
use crate::models::{NewUsageEntry, RateLimitWindow, Session, UsageFilter, UsageLogEntry, Verdict};
use crate::rate_limit_config::RateLimitRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use self::keyed_lock::KeyedLocks;
pub use self::memory::{MemoryRateLimitStore, MemorySessionStore, MemoryUsageStore};
pub use self::redis::RedisRateLimitStore;
pub use self::sqlite::SqliteStore;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Most recently active session created from `ip_address`
    async fn find_by_ip(&self, ip_address: &str) -> Result<Option<Session>>;

    async fn insert(&self, session: &Session) -> Result<()>;

    /// Bump `request_count` and `last_activity` in one step.
    /// Returns `None` when the session does not exist.
    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Session>>;

    /// Delete sessions idle since before `cutoff`
    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count(&self) -> Result<u64>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Atomically apply the fixed window rule to `key` at `now`
    async fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        rule: &RateLimitRule,
    ) -> Result<Verdict>;

    async fn get(&self, key: &str) -> Result<Option<RateLimitWindow>>;

    /// Remove the counter row; returns whether one existed
    async fn reset(&self, key: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Append an entry and return its id
    async fn append(&self, entry: NewUsageEntry) -> Result<i64>;

    /// Entries matching `filter` with `after_id < id <= max_id`, ascending by id
    async fn page(
        &self,
        filter: &UsageFilter,
        after_id: i64,
        max_id: i64,
        limit: u32,
    ) -> Result<Vec<UsageLogEntry>>;

    /// Highest id assigned so far, 0 when empty
    async fn max_id(&self) -> Result<i64>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// The three repositories a governor is built from
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionRepository>,
    pub rate_limits: Arc<dyn RateLimitRepository>,
    pub usage: Arc<dyn UsageRepository>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            usage: Arc::new(MemoryUsageStore::new()),
        }
    }

    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            sessions: store.clone(),
            rate_limits: store.clone(),
            usage: store,
        }
    }

    /// Replace the rate limit backend, keeping sessions and usage where they are
    pub fn with_rate_limits(mut self, rate_limits: Arc<dyn RateLimitRepository>) -> Self {
        self.rate_limits = rate_limits;
        self
    }
}
