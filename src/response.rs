use crate::models::UsageLogEntry;
use serde::Serialize;
use std::time::Duration;

/// Whole seconds a throttled client should wait, never zero
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    pub allowed: bool,
    pub retry_after: Option<u64>,
    pub message: String,
}

impl RateLimitResponse {
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after_secs(retry_after)),
            message: "Request rate limit exceeded".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionCountResponse {
    pub sessions: u64,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub purged: u64,
    pub retention_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub count: usize,
    pub entries: Vec<UsageLogEntry>,
}

impl UsageResponse {
    pub fn new(entries: Vec<UsageLogEntry>) -> Self {
        Self {
            count: entries.len(),
            entries,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub key: String,
    pub removed: bool,
}
