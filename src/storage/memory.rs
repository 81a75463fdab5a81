use super::{KeyedLocks, RateLimitRepository, SessionRepository, UsageRepository};
use crate::error::{GovernanceError, Result};
use crate::models::{NewUsageEntry, RateLimitWindow, Session, UsageFilter, UsageLogEntry, Verdict};
use crate::rate_limit_config::RateLimitRule;
use crate::rate_limiter::apply_fixed_window;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

fn poisoned(what: &str) -> GovernanceError {
    GovernanceError::Internal(format!("Failed to acquire lock on {}", what))
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().map_err(|_| poisoned("sessions"))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn find_by_ip(&self, ip_address: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().map_err(|_| poisoned("sessions"))?;
        Ok(sessions
            .values()
            .filter(|s| s.ip_address.as_deref() == Some(ip_address))
            .max_by_key(|s| s.last_activity)
            .cloned())
    }

    async fn insert(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        sessions
            .entry(session.session_id.clone())
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        Ok(sessions.get_mut(session_id).map(|session| {
            session.last_activity = session.last_activity.max(now);
            session.request_count += 1;
            session.clone()
        }))
    }

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity >= cutoff);
        Ok((before - sessions.len()) as u64)
    }

    async fn count(&self) -> Result<u64> {
        let sessions = self.sessions.read().map_err(|_| poisoned("sessions"))?;
        Ok(sessions.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: RwLock<HashMap<String, RateLimitWindow>>,
    locks: KeyedLocks,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitRepository for MemoryRateLimitStore {
    async fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        rule: &RateLimitRule,
    ) -> Result<Verdict> {
        let _guard = self.locks.lock(key).await;

        let current = {
            let windows = self.windows.read().map_err(|_| poisoned("rate limits"))?;
            windows.get(key).cloned()
        };

        let outcome = apply_fixed_window(current.as_ref(), key, now, rule);
        if let Some(updated) = outcome.updated {
            let mut windows = self.windows.write().map_err(|_| poisoned("rate limits"))?;
            windows.insert(key.to_string(), updated);
        }

        Ok(outcome.verdict)
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let windows = self.windows.read().map_err(|_| poisoned("rate limits"))?;
        Ok(windows.get(key).cloned())
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let _guard = self.locks.lock(key).await;
        let mut windows = self.windows.write().map_err(|_| poisoned("rate limits"))?;
        Ok(windows.remove(key).is_some())
    }
}

#[derive(Default)]
pub struct MemoryUsageStore {
    entries: RwLock<Vec<UsageLogEntry>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageStore {
    async fn append(&self, entry: NewUsageEntry) -> Result<i64> {
        let mut entries = self.entries.write().map_err(|_| poisoned("usage log"))?;
        let id = entries.len() as i64 + 1;
        entries.push(UsageLogEntry::from_new(id, entry));
        Ok(id)
    }

    async fn page(
        &self,
        filter: &UsageFilter,
        after_id: i64,
        max_id: i64,
        limit: u32,
    ) -> Result<Vec<UsageLogEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned("usage log"))?;
        Ok(entries
            .iter()
            .filter(|e| e.id > after_id && e.id <= max_id && filter.matches(e))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn max_id(&self) -> Result<i64> {
        let entries = self.entries.read().map_err(|_| poisoned("usage log"))?;
        Ok(entries.last().map(|e| e.id).unwrap_or(0))
    }
}
