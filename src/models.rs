use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A tracked client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: u64,
    pub ip_address: Option<String>,
}

impl Session {
    /// Fresh session with a random id and zero requests
    pub fn new(ip_address: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
            request_count: 0,
            ip_address,
        }
    }
}

/// Counter row for one rate limit key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub key: String,
    pub requests: u64,
    pub window_start: DateTime<Utc>,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied { retry_after: Duration },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Verdict::Allowed => None,
            Verdict::Denied { retry_after } => Some(*retry_after),
        }
    }
}

/// A usage entry before the store assigns it an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUsageEntry {
    pub session_id: Option<String>,
    pub endpoint: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
}

impl NewUsageEntry {
    pub fn success(endpoint: impl Into<String>, duration_ms: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            session_id: None,
            endpoint: endpoint.into(),
            duration_ms,
            success: true,
            error_message: None,
            timestamp,
            ip_address: None,
        }
    }

    pub fn failure(
        endpoint: impl Into<String>,
        duration_ms: u64,
        error_message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: None,
            endpoint: endpoint.into(),
            duration_ms,
            success: false,
            error_message: Some(error_message.into()),
            timestamp,
            ip_address: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    /// Drops an error message attached to a successful entry
    pub fn normalized(mut self) -> Self {
        if self.success {
            self.error_message = None;
        }
        self
    }
}

/// A persisted, immutable usage entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: i64,
    pub session_id: Option<String>,
    pub endpoint: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
}

impl UsageLogEntry {
    pub fn from_new(id: i64, entry: NewUsageEntry) -> Self {
        Self {
            id,
            session_id: entry.session_id,
            endpoint: entry.endpoint,
            duration_ms: entry.duration_ms,
            success: entry.success,
            error_message: entry.error_message,
            timestamp: entry.timestamp,
            ip_address: entry.ip_address,
        }
    }
}

/// Selection criteria for usage queries. `since` is inclusive, `until` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageFilter {
    pub session_id: Option<String>,
    pub endpoint: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub success: Option<bool>,
}

impl UsageFilter {
    pub fn matches(&self, entry: &UsageLogEntry) -> bool {
        if let Some(session_id) = &self.session_id {
            if entry.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(endpoint) = &self.endpoint {
            if &entry.endpoint != endpoint {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp >= until {
                return false;
            }
        }
        if let Some(success) = self.success {
            if entry.success != success {
                return false;
            }
        }
        true
    }
}

/// Millisecond conversions used by the persistent stores
pub(crate) fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
