use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::error::Result;
use crate::governance::Governor;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub sessions: ServiceStatus,
    pub rate_limits: ServiceStatus,
    pub usage_logs: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ServiceStatus {
    fn from_probe(result: Result<()>, started: Instant) -> Self {
        let response_time_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => Self {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(err) => Self {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(err.to_string()),
            },
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Clone)]
pub struct HealthChecker {
    governor: Arc<Governor>,
}

impl HealthChecker {
    pub fn new(governor: Arc<Governor>) -> Self {
        // Pin the uptime origin to service construction
        let _ = *START_TIME;
        Self { governor }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let started = Instant::now();
        let sessions = ServiceStatus::from_probe(self.governor.sessions().ping().await, started);
        let started = Instant::now();
        let rate_limits = ServiceStatus::from_probe(self.governor.limiter().ping().await, started);
        let started = Instant::now();
        let usage_logs = ServiceStatus::from_probe(self.governor.recorder().ping().await, started);

        // Admission fails closed without sessions or counters; a broken usage
        // log only degrades analytics
        let overall_status = if !sessions.is_healthy() || !rate_limits.is_healthy() {
            "unhealthy"
        } else if !usage_logs.is_healthy() {
            "degraded"
        } else {
            "healthy"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus {
                sessions,
                rate_limits,
                usage_logs,
            },
        }
    }
}
