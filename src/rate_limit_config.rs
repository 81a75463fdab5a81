use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Fixed window rule applied to every rate limit key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(with = "humantime_serde")]
    pub window_length: Duration,
    pub max_requests: u64,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

impl RateLimitRule {
    pub fn new(window_length: Duration, max_requests: u64) -> Self {
        Self {
            window_length,
            max_requests,
        }
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err("Maximum requests per window must be greater than 0".to_string());
        }
        if self.window_length.as_millis() == 0 {
            return Err("Window length must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Which identity a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Count per client IP address
    #[default]
    Ip,
    /// Count per resolved session id
    Session,
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ip" => Ok(KeyStrategy::Ip),
            "session" => Ok(KeyStrategy::Session),
            other => Err(format!(
                "Unknown rate limit key strategy '{}'. Must be 'ip' or 'session'",
                other
            )),
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => write!(f, "ip"),
            KeyStrategy::Session => write!(f, "session"),
        }
    }
}
