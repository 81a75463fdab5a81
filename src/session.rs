use crate::clock::Clock;
use crate::error::{GovernanceError, Result};
use crate::identity::{Identity, IdentityValidator};
use crate::models::Session;
use crate::storage::{KeyedLocks, SessionRepository};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    locks: Arc<KeyedLocks>,
}

impl SessionStore {
    pub fn new(repository: Arc<dyn SessionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Return the session for `identity`, creating one on first contact.
    ///
    /// A presented token that is unknown is never adopted as a session id; a
    /// fresh id is issued instead.
    pub async fn resolve(&self, identity: &Identity) -> Result<Session> {
        IdentityValidator::validate(identity)?;

        let lock_key = match identity {
            Identity::Ip(ip) => format!("ip:{}", ip),
            Identity::Session { token, .. } => format!("session:{}", token),
        };
        let _guard = self.locks.lock(&lock_key).await;

        let existing = match identity {
            Identity::Ip(ip) => self.repository.find_by_ip(ip).await?,
            Identity::Session { token, .. } => self.repository.get(token).await?,
        };

        if let Some(session) = existing {
            return Ok(session);
        }

        let session = Session::new(identity.ip().map(str::to_string), self.clock.now());
        self.repository.insert(&session).await?;
        tracing::debug!(
            session_id = %session.session_id,
            ip_address = ?session.ip_address,
            "Created session"
        );
        Ok(session)
    }

    /// Start a new session regardless of any existing one
    pub async fn create(&self, ip_address: Option<String>) -> Result<Session> {
        let session = Session::new(ip_address, self.clock.now());
        self.repository.insert(&session).await?;
        Ok(session)
    }

    /// Record one accepted request against the session
    pub async fn touch(&self, session_id: &str) -> Result<Session> {
        self.repository
            .touch(session_id, self.clock.now())
            .await?
            .ok_or_else(|| GovernanceError::NotFound(session_id.to_string()))
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        IdentityValidator::validate_session_token(session_id)?;
        self.repository
            .get(session_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(session_id.to_string()))
    }

    /// Purge sessions idle for longer than `retention_period`
    pub async fn sweep(&self, retention_period: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention_period)
            .map_err(|e| GovernanceError::Validation(format!("Retention period out of range: {}", e)))?;
        let cutoff = self.clock.now() - retention;

        let purged = self.repository.purge_inactive(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, %cutoff, "Swept inactive sessions");
        }
        Ok(purged)
    }

    pub async fn count(&self) -> Result<u64> {
        self.repository.count().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.repository.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemorySessionStore;

    fn store() -> (ManualClock, SessionStore) {
        let clock = ManualClock::at_epoch();
        let store = SessionStore::new(Arc::new(MemorySessionStore::new()), Arc::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_for_ip() {
        let (_clock, store) = store();
        let identity = Identity::Ip("1.2.3.4".to_string());

        let first = store.resolve(&identity).await.unwrap();
        let second = store.resolve(&identity).await.unwrap();
        assert_eq!(first.session_id, second.session_id);

        let touched = store.touch(&first.session_id).await.unwrap();
        assert_eq!(touched.request_count, 1);

        let third = store.resolve(&identity).await.unwrap();
        assert_eq!(third.session_id, first.session_id);
        assert_eq!(third.request_count, 1);
    }

    #[tokio::test]
    async fn test_resolve_known_token() {
        let (_clock, store) = store();
        let created = store.resolve(&Identity::Ip("1.2.3.4".to_string())).await.unwrap();

        let identity = Identity::Session {
            token: created.session_id.clone(),
            ip: Some("5.6.7.8".to_string()),
        };
        let resolved = store.resolve(&identity).await.unwrap();
        assert_eq!(resolved.session_id, created.session_id);
    }

    #[tokio::test]
    async fn test_unknown_token_gets_fresh_session() {
        let (_clock, store) = store();
        let identity = Identity::Session {
            token: "attacker-chosen-id".to_string(),
            ip: None,
        };

        let session = store.resolve(&identity).await.unwrap();
        assert_ne!(session.session_id, "attacker-chosen-id");
        assert_eq!(session.request_count, 0);
    }

    #[tokio::test]
    async fn test_invalid_identity_is_rejected() {
        let (_clock, store) = store();
        let err = store.resolve(&Identity::Ip("not an ip!".to_string())).await.unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidIdentity(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_unknown_session_is_not_found() {
        let (_clock, store) = store();
        let err = store.touch("missing").await.unwrap_err();
        assert!(matches!(err, GovernanceError::NotFound(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_updates_activity() {
        let (clock, store) = store();
        let session = store.resolve(&Identity::Ip("1.2.3.4".to_string())).await.unwrap();

        clock.advance(chrono::Duration::seconds(30));
        let touched = store.touch(&session.session_id).await.unwrap();
        assert_eq!(touched.last_activity, clock.now());
        assert!(touched.last_activity >= touched.created_at);
    }

    #[tokio::test]
    async fn test_concurrent_resolve_creates_one_session() {
        let (_clock, store) = store();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.resolve(&Identity::Ip("9.9.9.9".to_string())).await.unwrap().session_id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_idle_sessions() {
        let (clock, store) = store();
        let stale = store.resolve(&Identity::Ip("1.1.1.1".to_string())).await.unwrap();

        clock.advance(chrono::Duration::hours(2));
        let fresh = store.resolve(&Identity::Ip("2.2.2.2".to_string())).await.unwrap();

        let purged = store.sweep(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(purged, 1);
        tokio_test::assert_err!(store.get(&stale.session_id).await);
        tokio_test::assert_ok!(store.get(&fresh.session_id).await);
    }
}
