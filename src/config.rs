use crate::config_validator::ConfigValidator;
use crate::error::GovernanceError;
use crate::governance::GovernanceSettings;
use crate::rate_limit_config::{KeyStrategy, RateLimitRule};
use envconfig::Envconfig;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Where sessions, counters and usage logs live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!(
                "Unknown storage backend '{}'. Must be 'sqlite' or 'memory'",
                other
            )),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Sqlite => write!(f, "sqlite"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:8000")]
    pub bind_addr: SocketAddr,

    /// SQLite connection URL
    #[envconfig(from = "DATABASE_URL", default = "sqlite://neuber_correction.db")]
    pub database_url: String,

    #[envconfig(from = "DATABASE_MAX_CONNECTIONS", default = "5")]
    pub database_max_connections: u32,

    #[envconfig(from = "STORAGE_BACKEND", default = "sqlite")]
    pub storage_backend: StorageBackend,

    /// Optional Redis URL; when set, rate limit counters live in Redis
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Rate limit window length in seconds
    #[envconfig(from = "RATE_LIMIT_WINDOW_SECS", default = "60")]
    pub rate_limit_window_secs: u64,

    /// Requests allowed per window and key
    #[envconfig(from = "RATE_LIMIT_REQUESTS", default = "100")]
    pub rate_limit_requests: u64,

    #[envconfig(from = "RATE_LIMIT_KEY", default = "ip")]
    pub rate_limit_key: KeyStrategy,

    /// Idle time after which sessions are swept, in seconds
    #[envconfig(from = "SESSION_RETENTION_SECS", default = "86400")]
    pub session_retention_secs: u64,

    /// Interval between background session sweeps in seconds, 0 disables
    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "300")]
    pub sweep_interval_secs: u64,

    /// Write usage entries for throttled requests
    #[envconfig(from = "LOG_DENIALS", default = "true")]
    pub log_denials: bool,

    /// Bearer token for the `/admin` endpoints; they are not served without one
    #[envconfig(from = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    #[envconfig(from = "SESSION_COOKIE", default = "session_id")]
    pub session_cookie: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            database_url: "sqlite://neuber_correction.db".to_string(),
            database_max_connections: 5,
            storage_backend: StorageBackend::Sqlite,
            redis_url: None,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            rate_limit_key: KeyStrategy::Ip,
            session_retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
            log_denials: true,
            admin_token: None,
            session_cookie: "session_id".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// In-process configuration used by tests and local tooling
    pub fn in_memory() -> Self {
        Self {
            storage_backend: StorageBackend::Memory,
            sweep_interval_secs: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), GovernanceError> {
        ConfigValidator::validate_config(self)
    }

    pub fn rate_limit_rule(&self) -> RateLimitRule {
        RateLimitRule::new(
            Duration::from_secs(self.rate_limit_window_secs),
            self.rate_limit_requests,
        )
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn governance_settings(&self) -> GovernanceSettings {
        GovernanceSettings {
            key_strategy: self.rate_limit_key,
            log_denials: self.log_denials,
            retention_period: self.retention_period(),
        }
    }
}
