//! Session storage.
//!
//! `replace_active` is the only way a session is created: it revokes the
//! admin's active sessions and inserts the new one as a single step, so two
//! concurrent logins for one admin cannot both end up active.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::types::Json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::models::{RevokeReason, Session};
use crate::db::{Database, SafeRow, StoreError};
use crate::security::{Device, Location};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Revoke every active session of `session.admin_id` with `reason`, then
    /// insert `session`. Returns the number of sessions revoked.
    async fn replace_active(
        &self,
        session: &Session,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn find_by_token(&self, session_token: &str) -> Result<Option<Session>, StoreError>;

    /// Slide the activity window of an active session.
    async fn touch(
        &self,
        session_token: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns false if the session was already inactive or unknown.
    async fn revoke(
        &self,
        session_token: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn revoke_for_admin(
        &self,
        admin_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn list_active(&self, admin_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError>;

    /// Hard-delete sessions past their expiry.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

fn mark_revoked(session: &mut Session, reason: RevokeReason, now: DateTime<Utc>) {
    session.is_active = false;
    session.revoked_at = Some(now);
    session.revoked_reason = Some(reason);
}

// ============================================================================
// In-memory store
// ============================================================================

/// Keyed by session token.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    // Serializes replace_active so revoke + insert is one step.
    replace_lock: Mutex<()>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn revoke_admin_sessions(&self, admin_id: Uuid, reason: RevokeReason, now: DateTime<Utc>) -> u64 {
        let mut revoked = 0;
        for mut entry in self.sessions.iter_mut() {
            let s = entry.value_mut();
            if s.admin_id == admin_id && s.is_active {
                mark_revoked(s, reason, now);
                revoked += 1;
            }
        }
        revoked
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn replace_active(
        &self,
        session: &Session,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let _guard = self.replace_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.sessions.contains_key(&session.session_token) {
            return Err(StoreError::Duplicate(session.session_token.clone()));
        }
        let revoked = self.revoke_admin_sessions(session.admin_id, reason, now);
        self.sessions
            .insert(session.session_token.clone(), session.clone());
        Ok(revoked)
    }

    async fn find_by_token(&self, session_token: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(session_token).map(|s| s.clone()))
    }

    async fn touch(
        &self,
        session_token: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(match self.sessions.get_mut(session_token) {
            Some(mut s) if s.is_active => {
                s.last_activity = last_activity;
                s.expires_at = expires_at;
                true
            }
            _ => false,
        })
    }

    async fn revoke(
        &self,
        session_token: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(match self.sessions.get_mut(session_token) {
            Some(mut s) if s.is_active => {
                mark_revoked(&mut s, reason, now);
                true
            }
            _ => false,
        })
    }

    async fn revoke_for_admin(
        &self,
        admin_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let _guard = self.replace_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.revoke_admin_sessions(admin_id, reason, now))
    }

    async fn list_active(&self, admin_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        let mut out: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.admin_id == admin_id && s.is_active && s.expires_at > now)
            .map(|s| s.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - self.sessions.len()) as u64)
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

const SESSION_COLUMNS: &str = "id, admin_id, session_token, token_hash, ip_address, device, \
     location, is_active, last_activity, expires_at, created_at, revoked_at, revoked_reason";

pub struct PgSessionStore {
    db: Arc<Database>,
}

impl PgSessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session, StoreError> {
        let device: Option<Json<Device>> = row.optional("device");
        let location: Option<Json<Location>> = row.optional("location");
        let revoked_reason: Option<String> = row.optional("revoked_reason");
        Ok(Session {
            id: row.require("id")?,
            admin_id: row.require("admin_id")?,
            session_token: row.require("session_token")?,
            token_hash: row.require("token_hash")?,
            ip_address: row.require("ip_address")?,
            device: device.map(|d| d.0),
            location: location.map(|l| l.0),
            is_active: row.require("is_active")?,
            last_activity: row.require("last_activity")?,
            expires_at: row.require("expires_at")?,
            created_at: row.require("created_at")?,
            revoked_at: row.optional("revoked_at"),
            revoked_reason: revoked_reason.map(|r| r.parse()).transpose()?,
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn replace_active(
        &self,
        session: &Session,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.db.pool().begin().await?;

        // Row lock on the admin serializes concurrent logins for the same admin.
        sqlx::query("SELECT id FROM admins WHERE id = $1 FOR UPDATE")
            .bind(session.admin_id)
            .fetch_optional(&mut *tx)
            .await?;

        let revoked = sqlx::query(
            r#"
            UPDATE sessions
            SET is_active = FALSE, revoked_at = $2, revoked_reason = $3
            WHERE admin_id = $1 AND is_active
            "#,
        )
        .bind(session.admin_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, admin_id, session_token, token_hash, ip_address, device, location,
                 is_active, last_activity, expires_at, created_at, revoked_at, revoked_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL, NULL)
            "#,
        )
        .bind(session.id)
        .bind(session.admin_id)
        .bind(&session.session_token)
        .bind(&session.token_hash)
        .bind(&session.ip_address)
        .bind(session.device.as_ref().map(Json))
        .bind(session.location.as_ref().map(Json))
        .bind(session.is_active)
        .bind(session.last_activity)
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_insert(e, "session"))?;

        tx.commit().await?;
        Ok(revoked)
    }

    async fn find_by_token(&self, session_token: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_token = $1"
        ))
        .bind(session_token)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn touch(
        &self,
        session_token: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET last_activity = $2, expires_at = $3 \
             WHERE session_token = $1 AND is_active",
        )
        .bind(session_token)
        .bind(last_activity)
        .bind(expires_at)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke(
        &self,
        session_token: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = FALSE, revoked_at = $2, revoked_reason = $3 \
             WHERE session_token = $1 AND is_active",
        )
        .bind(session_token)
        .bind(now)
        .bind(reason.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_for_admin(
        &self,
        admin_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = FALSE, revoked_at = $2, revoked_reason = $3 \
             WHERE admin_id = $1 AND is_active",
        )
        .bind(admin_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self, admin_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE admin_id = $1 AND is_active AND expires_at > $2 \
             ORDER BY created_at DESC"
        ))
        .bind(admin_id)
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
