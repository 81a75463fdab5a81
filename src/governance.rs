use crate::clock::Clock;
use crate::error::{GovernanceError, Result};
use crate::identity::{Identity, IdentityValidator};
use crate::metrics::{Decision, GovernanceMetrics, MetricsCollector};
use crate::models::{NewUsageEntry, Session, Verdict};
use crate::rate_limit_config::{KeyStrategy, RateLimitRule};
use crate::rate_limiter::RateLimiter;
use crate::session::SessionStore;
use crate::storage::Storage;
use crate::usage::UsageRecorder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Error message stored for requests turned away by the limiter
pub const RATE_LIMITED_MESSAGE: &str = "rate limit exceeded";

/// Knobs that shape admission, independent of the storage backend
#[derive(Debug, Clone)]
pub struct GovernanceSettings {
    pub key_strategy: KeyStrategy,
    /// Whether throttled requests get a usage log entry
    pub log_denials: bool,
    pub retention_period: Duration,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategy::Ip,
            log_denials: true,
            retention_period: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of the admission step for one request
#[derive(Debug)]
pub enum Admission {
    Admitted {
        session: Session,
        key: String,
    },
    Throttled {
        session: Session,
        key: String,
        retry_after: Duration,
    },
    /// Admission could not be decided; the request must be denied
    Rejected { error: GovernanceError },
}

/// Session tracking, rate limiting and usage logging behind one handle.
///
/// Each component commits independently; there is no transaction spanning
/// a session touch, a counter increment and a usage entry.
pub struct Governor {
    sessions: SessionStore,
    limiter: RateLimiter,
    recorder: UsageRecorder,
    metrics: MetricsCollector,
    clock: Arc<dyn Clock>,
    settings: GovernanceSettings,
}

impl Governor {
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        rule: RateLimitRule,
        settings: GovernanceSettings,
    ) -> Result<Self> {
        Ok(Self {
            sessions: SessionStore::new(storage.sessions, clock.clone()),
            limiter: RateLimiter::new(storage.rate_limits, clock.clone(), rule)?,
            recorder: UsageRecorder::new(storage.usage),
            metrics: MetricsCollector::new(),
            clock,
            settings,
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    pub fn settings(&self) -> &GovernanceSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Resolve the caller's session, failing open to a fresh session when
    /// the presented identity is unusable. Storage failures are returned.
    pub async fn resolve_session(&self, identity: &Identity) -> Result<Session> {
        match self.sessions.resolve(identity).await {
            Ok(session) => Ok(session),
            Err(err @ (GovernanceError::InvalidIdentity(_) | GovernanceError::NotFound(_))) => {
                tracing::warn!(error = %err, "Unusable identity, issuing a fresh session");
                self.fresh_session(identity).await
            }
            Err(err) => Err(err),
        }
    }

    async fn fresh_session(&self, identity: &Identity) -> Result<Session> {
        let ip = identity
            .ip()
            .filter(|ip| IdentityValidator::validate_key(ip).is_ok());

        match ip {
            // A bad token with a good address falls back to the address
            Some(ip) if identity.token().is_some() => {
                self.sessions.resolve(&Identity::Ip(ip.to_string())).await
            }
            ip => self.sessions.create(ip.map(str::to_string)).await,
        }
    }

    /// Fail-closed rate limit check: any error is a denial
    pub async fn check_rate_limit(&self, key: &str, now: DateTime<Utc>) -> Verdict {
        match self.limiter.check_at(key, now).await {
            Ok(verdict) => {
                self.metrics.record(decision_for(&verdict));
                verdict
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "Rate limit check failed, denying request");
                self.metrics.record(Decision::Rejected);
                Verdict::Denied {
                    retry_after: self.limiter.rule().window_length,
                }
            }
        }
    }

    pub async fn log_usage(&self, entry: NewUsageEntry) {
        self.recorder.record(entry).await;
    }

    /// Record a throttled request when denial logging is enabled
    pub async fn log_denial(&self, entry: NewUsageEntry) {
        if self.settings.log_denials {
            self.recorder.record(entry).await;
        }
    }

    /// Which string a request is counted against
    pub fn rate_limit_key(&self, identity: &Identity, session: &Session) -> String {
        match (self.settings.key_strategy, identity.ip()) {
            (KeyStrategy::Ip, Some(ip)) => ip.to_string(),
            _ => session.session_id.clone(),
        }
    }

    /// Resolve the session, consult the limiter and count the request
    pub async fn admit(&self, identity: &Identity) -> Admission {
        // An address that cannot be a rate limit key is refused before any
        // session row is written
        if let (KeyStrategy::Ip, Some(ip)) = (self.settings.key_strategy, identity.ip()) {
            if let Err(error) = IdentityValidator::validate_key(ip) {
                tracing::warn!(error = %error, "Unusable client address, denying request");
                self.metrics.record(Decision::Rejected);
                return Admission::Rejected { error };
            }
        }

        let session = match self.resolve_session(identity).await {
            Ok(session) => session,
            Err(error) => {
                tracing::error!(error = %error, "Session resolution failed");
                self.metrics.record(Decision::Rejected);
                return Admission::Rejected { error };
            }
        };

        let key = self.rate_limit_key(identity, &session);
        let verdict = match self.limiter.check_at(&key, self.clock.now()).await {
            Ok(verdict) => verdict,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Rate limit check failed, denying request");
                self.metrics.record(Decision::Rejected);
                return Admission::Rejected { error };
            }
        };
        self.metrics.record(decision_for(&verdict));

        match verdict {
            Verdict::Denied { retry_after } => Admission::Throttled {
                session,
                key,
                retry_after,
            },
            Verdict::Allowed => match self.touch_or_replace(identity, &session).await {
                Ok(session) => Admission::Admitted { session, key },
                Err(error) => {
                    tracing::error!(error = %error, "Failed to update session activity");
                    Admission::Rejected { error }
                }
            },
        }
    }

    async fn touch_or_replace(&self, identity: &Identity, session: &Session) -> Result<Session> {
        match self.sessions.touch(&session.session_id).await {
            Err(GovernanceError::NotFound(_)) => {
                // Swept between resolve and touch
                let replacement = self.fresh_session(identity).await?;
                self.sessions.touch(&replacement.session_id).await
            }
            other => other,
        }
    }

    /// Drop the counter for `key`
    pub async fn reset_rate_limit(&self, key: &str) -> Result<bool> {
        self.limiter.reset(key).await
    }

    pub async fn sweep_sessions(&self) -> Result<u64> {
        self.sessions.sweep(self.settings.retention_period).await
    }

    pub fn metrics(&self) -> GovernanceMetrics {
        self.metrics.snapshot(self.recorder.dropped())
    }
}

fn decision_for(verdict: &Verdict) -> Decision {
    match verdict {
        Verdict::Allowed => Decision::Admitted,
        Verdict::Denied { .. } => Decision::Throttled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{UsageFilter, UsageLogEntry};
    use crate::storage::{RateLimitRepository, SessionRepository};
    use async_trait::async_trait;

    struct UnavailableRateLimits;

    #[async_trait]
    impl RateLimitRepository for UnavailableRateLimits {
        async fn check_and_increment(&self, _: &str, _: DateTime<Utc>, _: &RateLimitRule) -> Result<Verdict> {
            Err(GovernanceError::StorageUnavailable("connection refused".to_string()))
        }

        async fn get(&self, _: &str) -> Result<Option<crate::models::RateLimitWindow>> {
            Err(GovernanceError::StorageUnavailable("connection refused".to_string()))
        }

        async fn reset(&self, _: &str) -> Result<bool> {
            Err(GovernanceError::StorageUnavailable("connection refused".to_string()))
        }
    }

    struct UnavailableSessions;

    #[async_trait]
    impl SessionRepository for UnavailableSessions {
        async fn get(&self, _: &str) -> Result<Option<Session>> {
            Err(GovernanceError::StorageUnavailable("database is locked".to_string()))
        }

        async fn find_by_ip(&self, _: &str) -> Result<Option<Session>> {
            Err(GovernanceError::StorageUnavailable("database is locked".to_string()))
        }

        async fn insert(&self, _: &Session) -> Result<()> {
            Err(GovernanceError::StorageUnavailable("database is locked".to_string()))
        }

        async fn touch(&self, _: &str, _: DateTime<Utc>) -> Result<Option<Session>> {
            Err(GovernanceError::StorageUnavailable("database is locked".to_string()))
        }

        async fn purge_inactive(&self, _: DateTime<Utc>) -> Result<u64> {
            Err(GovernanceError::StorageUnavailable("database is locked".to_string()))
        }

        async fn count(&self) -> Result<u64> {
            Err(GovernanceError::StorageUnavailable("database is locked".to_string()))
        }
    }

    fn governor_with(storage: Storage, max_requests: u64, settings: GovernanceSettings) -> (ManualClock, Governor) {
        let clock = ManualClock::at_epoch();
        let governor = Governor::new(
            storage,
            Arc::new(clock.clone()),
            RateLimitRule::new(Duration::from_secs(60), max_requests),
            settings,
        )
        .unwrap();
        (clock, governor)
    }

    fn governor(max_requests: u64) -> (ManualClock, Governor) {
        governor_with(Storage::in_memory(), max_requests, GovernanceSettings::default())
    }

    async fn all_usage(governor: &Governor) -> Vec<UsageLogEntry> {
        governor.recorder().query(UsageFilter::default()).collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_admit_counts_only_accepted_requests() {
        let (_clock, governor) = governor(2);
        let identity = Identity::Ip("1.2.3.4".to_string());

        for _ in 0..2 {
            assert!(matches!(governor.admit(&identity).await, Admission::Admitted { .. }));
        }
        let throttled = governor.admit(&identity).await;
        let session = match throttled {
            Admission::Throttled { session, retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(60));
                session
            }
            other => panic!("expected throttle, got {:?}", other),
        };

        let stored = governor.sessions().get(&session.session_id).await.unwrap();
        assert_eq!(stored.request_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_token_fails_open_to_address_session() {
        let (_clock, governor) = governor(5);
        let by_ip = governor.resolve_session(&Identity::Ip("1.2.3.4".to_string())).await.unwrap();

        let identity = Identity::Session {
            token: "bad token;".to_string(),
            ip: Some("1.2.3.4".to_string()),
        };
        let session = governor.resolve_session(&identity).await.unwrap();
        assert_eq!(session.session_id, by_ip.session_id);
    }

    #[tokio::test]
    async fn test_invalid_address_fails_closed_on_limiter() {
        let (_clock, governor) = governor(5);
        for _ in 0..50 {
            let admission = governor.admit(&Identity::Ip("bad!ip".to_string())).await;
            assert!(matches!(
                admission,
                Admission::Rejected { error: GovernanceError::InvalidIdentity(_) }
            ));
        }

        // Refused requests leave no session rows behind
        assert_eq!(governor.sessions().count().await.unwrap(), 0);
        assert_eq!(governor.metrics().rejected_requests, 50);
    }

    #[tokio::test]
    async fn test_session_store_outage_denies() {
        let storage = Storage {
            sessions: Arc::new(UnavailableSessions),
            ..Storage::in_memory()
        };
        let (_clock, governor) = governor_with(storage, 5, GovernanceSettings::default());

        let admission = governor.admit(&Identity::Ip("1.2.3.4".to_string())).await;
        assert!(matches!(
            admission,
            Admission::Rejected { error: GovernanceError::StorageUnavailable(_) }
        ));

        // Nothing was counted against the address
        assert_eq!(governor.limiter().status("1.2.3.4").await.unwrap().requests, 0);
        assert_eq!(governor.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_session_strategy_keys_by_session() {
        let settings = GovernanceSettings {
            key_strategy: KeyStrategy::Session,
            ..Default::default()
        };
        let (_clock, governor) = governor_with(Storage::in_memory(), 1, settings);

        let admission = governor.admit(&Identity::Ip("1.2.3.4".to_string())).await;
        match admission {
            Admission::Admitted { session, key } => assert_eq!(key, session.session_id),
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limiter_outage_denies() {
        let storage = Storage::in_memory().with_rate_limits(Arc::new(UnavailableRateLimits));
        let (_clock, governor) = governor_with(storage, 5, GovernanceSettings::default());

        let admission = governor.admit(&Identity::Ip("1.2.3.4".to_string())).await;
        assert!(matches!(
            admission,
            Admission::Rejected { error: GovernanceError::StorageUnavailable(_) }
        ));

        let verdict = governor.check_rate_limit("1.2.3.4", governor.now()).await;
        assert_eq!(verdict, Verdict::Denied { retry_after: Duration::from_secs(60) });
    }

    #[tokio::test]
    async fn test_denial_logging_toggle() {
        let settings = GovernanceSettings {
            log_denials: false,
            ..Default::default()
        };
        let (clock, quiet) = governor_with(Storage::in_memory(), 1, settings);

        quiet
            .log_denial(NewUsageEntry::failure("/api/correct", 0, RATE_LIMITED_MESSAGE, clock.now()))
            .await;
        assert!(all_usage(&quiet).await.is_empty());

        let (clock, verbose) = governor(1);
        verbose
            .log_denial(NewUsageEntry::failure("/api/correct", 0, RATE_LIMITED_MESSAGE, clock.now()))
            .await;
        let entries = all_usage(&verbose).await;
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
    }

    #[tokio::test]
    async fn test_sweep_uses_retention_setting() {
        let (clock, governor) = governor(5);
        governor.admit(&Identity::Ip("1.2.3.4".to_string())).await;

        clock.advance(chrono::Duration::hours(25));
        assert_eq!(governor.sweep_sessions().await.unwrap(), 1);
        assert_eq!(governor.sessions().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metrics_track_decisions() {
        let (_clock, governor) = governor(1);
        let identity = Identity::Ip("1.2.3.4".to_string());
        governor.admit(&identity).await;
        governor.admit(&identity).await;

        let metrics = governor.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.admitted_requests, 1);
        assert_eq!(metrics.throttled_requests, 1);
    }
}
