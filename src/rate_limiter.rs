use crate::clock::Clock;
use crate::error::{GovernanceError, Result};
use crate::identity::IdentityValidator;
use crate::models::{RateLimitWindow, Verdict};
use crate::rate_limit_config::RateLimitRule;
use crate::storage::RateLimitRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of applying the rule to a counter row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    pub verdict: Verdict,
    /// Row to persist; `None` when nothing changed
    pub updated: Option<RateLimitWindow>,
}

/// Apply the fixed window rule to the current row for `key`.
///
/// A window covers `[window_start, window_start + window_length)`. Two adjacent
/// windows can together admit up to `2 * max_requests` around their boundary.
pub fn apply_fixed_window(
    current: Option<&RateLimitWindow>,
    key: &str,
    now: DateTime<Utc>,
    rule: &RateLimitRule,
) -> WindowOutcome {
    let mut window = current.cloned().unwrap_or_else(|| RateLimitWindow {
        key: key.to_string(),
        requests: 0,
        window_start: now,
    });

    if elapsed(window.window_start, now) >= rule.window_length {
        window.window_start = now;
        window.requests = 0;
    }

    if window.requests < rule.max_requests {
        window.requests += 1;
        WindowOutcome {
            verdict: Verdict::Allowed,
            updated: Some(window),
        }
    } else {
        WindowOutcome {
            verdict: Verdict::Denied {
                retry_after: retry_after(window.window_start, now, rule),
            },
            updated: None,
        }
    }
}

/// Time since the window opened; zero if the clock stepped backwards
fn elapsed(window_start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - window_start).to_std().unwrap_or(Duration::ZERO)
}

/// Time left until the window containing `now` closes
pub fn retry_after(window_start: DateTime<Utc>, now: DateTime<Utc>, rule: &RateLimitRule) -> Duration {
    rule.window_length.saturating_sub(elapsed(window_start, now))
}

/// Current state of a key as reported by the admin endpoints
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub limit: u64,
    pub requests: u64,
    pub remaining: u64,
    pub window_start: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub window_length: Duration,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitRepository>,
    clock: Arc<dyn Clock>,
    rule: RateLimitRule,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitRepository>,
        clock: Arc<dyn Clock>,
        rule: RateLimitRule,
    ) -> Result<Self> {
        rule.validate().map_err(GovernanceError::Configuration)?;
        Ok(Self { store, clock, rule })
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    /// Check `key` against an explicit rule at an explicit instant
    pub async fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window_length: Duration,
        max_requests: u64,
    ) -> Result<Verdict> {
        IdentityValidator::validate_key(key)?;
        let rule = RateLimitRule::new(window_length, max_requests);
        rule.validate().map_err(GovernanceError::Validation)?;

        let verdict = self.store.check_and_increment(key, now, &rule).await?;
        match verdict {
            Verdict::Allowed => tracing::trace!(key, "Request allowed"),
            Verdict::Denied { retry_after } => tracing::debug!(
                key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            ),
        }
        Ok(verdict)
    }

    /// Check `key` at `now` using the configured rule
    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<Verdict> {
        self.check_and_increment(key, now, self.rule.window_length, self.rule.max_requests)
            .await
    }

    /// Check `key` using the configured rule and the injected clock
    pub async fn check(&self, key: &str) -> Result<Verdict> {
        self.check_at(key, self.clock.now()).await
    }

    pub async fn status(&self, key: &str) -> Result<RateLimitStatus> {
        IdentityValidator::validate_key(key)?;
        let now = self.clock.now();
        let window = self.store.get(key).await?;

        // An expired window counts as empty
        let live = window.filter(|w| elapsed(w.window_start, now) < self.rule.window_length);
        let requests = live.as_ref().map(|w| w.requests).unwrap_or(0);

        Ok(RateLimitStatus {
            key: key.to_string(),
            limit: self.rule.max_requests,
            requests,
            remaining: self.rule.max_requests.saturating_sub(requests),
            window_start: live.map(|w| w.window_start),
            window_length: self.rule.window_length,
        })
    }

    pub async fn reset(&self, key: &str) -> Result<bool> {
        IdentityValidator::validate_key(key)?;
        let removed = self.store.reset(key).await?;
        tracing::info!(key, removed, "Rate limit reset");
        Ok(removed)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}
