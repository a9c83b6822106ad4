//! Opaque admin sessions with a sliding inactivity window.
//!
//! A session is valid iff it is active, unexpired, and bound to the signed
//! token being presented. Each successful validation pushes `expires_at`
//! out to `now + ttl`. Creating a session revokes the admin's previous ones.

pub mod models;
pub mod repository;

pub use models::{RevokeReason, Session, SessionMetadata, generate_session_token};
pub use repository::{MemorySessionStore, PgSessionStore, SessionStore};

use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::StoreError;
use crate::logging::token_prefix;
use crate::security::SessionRejection;
use crate::token::hash_token;

pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub enum SessionCheck {
    Valid(Session),
    Invalid(SessionRejection),
}

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session bound to `signed_token`, revoking every other active
    /// session of the admin.
    pub async fn create_session(
        &self,
        admin_id: Uuid,
        signed_token: &str,
        metadata: SessionMetadata,
    ) -> Result<Session, StoreError> {
        let now = self.clock.now();
        let session = Session {
            id: Uuid::new_v4(),
            admin_id,
            session_token: generate_session_token(),
            token_hash: hash_token(signed_token),
            ip_address: metadata.ip_address,
            device: metadata.device,
            location: metadata.location,
            is_active: true,
            last_activity: now,
            expires_at: now + self.ttl,
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        };

        let revoked = self
            .store
            .replace_active(&session, RevokeReason::NewSessionCreated, now)
            .await?;
        tracing::info!(
            admin_id = %admin_id,
            session = token_prefix(&session.session_token),
            revoked,
            "Session created"
        );
        Ok(session)
    }

    pub async fn validate_session(
        &self,
        session_token: &str,
        signed_token: &str,
    ) -> Result<SessionCheck, StoreError> {
        let Some(mut session) = self.store.find_by_token(session_token).await? else {
            return Ok(SessionCheck::Invalid(SessionRejection::NotFound));
        };

        let now = self.clock.now();
        if let Err(rejection) = session.check(&hash_token(signed_token), now) {
            if rejection == SessionRejection::Expired {
                // Keep the row for audit until the retention sweep deletes it.
                self.store
                    .revoke(session_token, RevokeReason::Expired, now)
                    .await?;
            }
            return Ok(SessionCheck::Invalid(rejection));
        }

        let expires_at = now + self.ttl;
        if !self.store.touch(session_token, now, expires_at).await? {
            // Revoked between the read and the slide.
            return Ok(SessionCheck::Invalid(SessionRejection::Inactive));
        }
        session.last_activity = now;
        session.expires_at = expires_at;
        Ok(SessionCheck::Valid(session))
    }

    /// Idempotent: revoking an inactive or unknown session is not an error.
    pub async fn revoke_session(
        &self,
        session_token: &str,
        reason: RevokeReason,
    ) -> Result<bool, StoreError> {
        let revoked = self
            .store
            .revoke(session_token, reason, self.clock.now())
            .await?;
        if revoked {
            tracing::info!(
                session = token_prefix(session_token),
                reason = reason.as_str(),
                "Session revoked"
            );
        }
        Ok(revoked)
    }

    pub async fn revoke_all_sessions(
        &self,
        admin_id: Uuid,
        reason: RevokeReason,
    ) -> Result<u64, StoreError> {
        let revoked = self
            .store
            .revoke_for_admin(admin_id, reason, self.clock.now())
            .await?;
        tracing::warn!(admin_id = %admin_id, reason = reason.as_str(), revoked, "All sessions revoked");
        Ok(revoked)
    }

    pub async fn list_active_sessions(&self, admin_id: Uuid) -> Result<Vec<Session>, StoreError> {
        self.store.list_active(admin_id, self.clock.now()).await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service() -> (SessionService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let svc = SessionService::new(
            Arc::new(MemorySessionStore::new()),
            clock.clone(),
            Duration::minutes(DEFAULT_SESSION_TTL_MINUTES),
        );
        (svc, clock)
    }

    fn meta() -> SessionMetadata {
        SessionMetadata {
            ip_address: "198.51.100.4".into(),
            ..Default::default()
        }
    }

    fn is_valid(check: &SessionCheck) -> bool {
        matches!(check, SessionCheck::Valid(_))
    }

    fn rejection(check: SessionCheck) -> Option<SessionRejection> {
        match check {
            SessionCheck::Invalid(r) => Some(r),
            SessionCheck::Valid(_) => None,
        }
    }

    #[tokio::test]
    async fn test_valid_until_thirty_idle_minutes() {
        let (svc, clock) = service();
        let admin = Uuid::new_v4();
        let s = svc.create_session(admin, "jwt-1", meta()).await.unwrap();

        clock.advance(Duration::minutes(29));
        assert!(is_valid(&svc.validate_session(&s.session_token, "jwt-1").await.unwrap()));

        // Activity slid the window; another 29 minutes is still inside it.
        clock.advance(Duration::minutes(29));
        assert!(is_valid(&svc.validate_session(&s.session_token, "jwt-1").await.unwrap()));

        clock.advance(Duration::minutes(30));
        assert_eq!(
            rejection(svc.validate_session(&s.session_token, "jwt-1").await.unwrap()),
            Some(SessionRejection::Expired)
        );
        // Expired sessions are marked inactive afterwards.
        assert_eq!(
            rejection(svc.validate_session(&s.session_token, "jwt-1").await.unwrap()),
            Some(SessionRejection::Inactive)
        );
    }

    #[tokio::test]
    async fn test_new_session_evicts_previous() {
        let (svc, _) = service();
        let admin = Uuid::new_v4();
        let other_admin = Uuid::new_v4();
        let s1 = svc.create_session(admin, "t1", meta()).await.unwrap();
        let other = svc.create_session(other_admin, "t9", meta()).await.unwrap();
        let s2 = svc.create_session(admin, "t2", meta()).await.unwrap();

        assert_eq!(
            rejection(svc.validate_session(&s1.session_token, "t1").await.unwrap()),
            Some(SessionRejection::Inactive)
        );
        assert!(is_valid(&svc.validate_session(&s2.session_token, "t2").await.unwrap()));
        // Another admin's session is untouched.
        assert!(is_valid(&svc.validate_session(&other.session_token, "t9").await.unwrap()));

        let active = svc.list_active_sessions(admin).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_token, s2.session_token);
    }

    #[tokio::test]
    async fn test_token_mismatch_and_unknown() {
        let (svc, _) = service();
        let s = svc
            .create_session(Uuid::new_v4(), "issued", meta())
            .await
            .unwrap();
        assert_eq!(
            rejection(svc.validate_session(&s.session_token, "other").await.unwrap()),
            Some(SessionRejection::TokenMismatch)
        );
        assert_eq!(
            rejection(svc.validate_session("deadbeef", "issued").await.unwrap()),
            Some(SessionRejection::NotFound)
        );
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (svc, _) = service();
        let s = svc.create_session(Uuid::new_v4(), "t", meta()).await.unwrap();
        assert!(svc.revoke_session(&s.session_token, RevokeReason::Logout).await.unwrap());
        assert!(!svc.revoke_session(&s.session_token, RevokeReason::Logout).await.unwrap());
        assert!(!svc.revoke_session("missing", RevokeReason::Logout).await.unwrap());
        assert_eq!(
            rejection(svc.validate_session(&s.session_token, "t").await.unwrap()),
            Some(SessionRejection::Inactive)
        );
    }

    #[tokio::test]
    async fn test_revoke_all_and_purge() {
        let (svc, clock) = service();
        let admin = Uuid::new_v4();
        svc.create_session(admin, "t", meta()).await.unwrap();
        assert_eq!(
            svc.revoke_all_sessions(admin, RevokeReason::SecurityRevocation)
                .await
                .unwrap(),
            1
        );
        assert!(svc.list_active_sessions(admin).await.unwrap().is_empty());

        clock.advance(Duration::minutes(31));
        assert_eq!(svc.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_relogin_leaves_one_active() {
        let (svc, _) = service();
        let svc = Arc::new(svc);
        let admin = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    svc.create_session(admin, &format!("jwt-{i}"), meta())
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }

        let active = svc.list_active_sessions(admin).await.unwrap();
        assert_eq!(active.len(), 1);

        let mut valid = 0;
        for (i, s) in sessions.iter().enumerate() {
            let check = svc
                .validate_session(&s.session_token, &format!("jwt-{i}"))
                .await
                .unwrap();
            if is_valid(&check) {
                valid += 1;
                assert_eq!(s.session_token, active[0].session_token);
            }
        }
        assert_eq!(valid, 1);
    }
}
