//! Append-only authentication audit log.
//!
//! Entries are never updated. Failure counts over a recent window feed the
//! suspicious-activity escalator; rows older than the retention period are
//! purged by the sweeper.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use super::enrich::{ClientInfo, Device, Location};
use crate::clock::Clock;
use crate::db::{Database, SafeRow, StoreError};

pub const ATTEMPT_RETENTION_DAYS: i64 = 90;

/// Failure reasons a legitimate client hits in normal use: no credentials
/// yet, an expired token, an idle or superseded session. They are logged
/// but never count toward escalation.
pub const RECOVERABLE_FAILURES: [&str; 4] = [
    "missing_credentials",
    "token_expired",
    "session_expired",
    "session_inactive",
];

pub fn is_recoverable_failure(reason: &str) -> bool {
    RECOVERABLE_FAILURES.contains(&reason)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    OtpRequest,
    OtpVerify,
    TokenValidation,
    DevLogin,
    AdminLogin,
    QrVerify,
    IpBlocked,
    RateLimited,
    SessionCheck,
    Logout,
    ReplayRejected,
    PayloadDecrypt,
}

impl AttemptStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtpRequest => "otp_request",
            Self::OtpVerify => "otp_verify",
            Self::TokenValidation => "token_validation",
            Self::DevLogin => "dev_login",
            Self::AdminLogin => "admin_login",
            Self::QrVerify => "qr_verify",
            Self::IpBlocked => "ip_blocked",
            Self::RateLimited => "rate_limited",
            Self::SessionCheck => "session_check",
            Self::Logout => "logout",
            Self::ReplayRejected => "replay_rejected",
            Self::PayloadDecrypt => "payload_decrypt",
        }
    }
}

impl FromStr for AttemptStage {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "otp_request" => Self::OtpRequest,
            "otp_verify" => Self::OtpVerify,
            "token_validation" => Self::TokenValidation,
            "dev_login" => Self::DevLogin,
            "admin_login" => Self::AdminLogin,
            "qr_verify" => Self::QrVerify,
            "ip_blocked" => Self::IpBlocked,
            "rate_limited" => Self::RateLimited,
            "session_check" => Self::SessionCheck,
            "logout" => Self::Logout,
            "replay_rejected" => Self::ReplayRejected,
            "payload_decrypt" => Self::PayloadDecrypt,
            other => return Err(StoreError::Corrupt(format!("unknown stage '{}'", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub ip_address: String,
    pub phone_number: Option<String>,
    pub success: bool,
    pub stage: AttemptStage,
    pub failure_reason: Option<String>,
    pub device: Option<Device>,
    pub location: Option<Location>,
    pub session_token: Option<String>,
    pub admin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An attempt about to be recorded; id and timestamp are assigned by the log.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    ip_address: String,
    phone_number: Option<String>,
    success: bool,
    stage: AttemptStage,
    failure_reason: Option<String>,
    device: Option<Device>,
    location: Option<Location>,
    session_token: Option<String>,
    admin_id: Option<Uuid>,
}

impl NewAttempt {
    pub fn success(ip: &str, stage: AttemptStage) -> Self {
        Self::new(ip, stage, true, None)
    }

    pub fn failure(ip: &str, stage: AttemptStage, reason: impl Into<String>) -> Self {
        Self::new(ip, stage, false, Some(reason.into()))
    }

    fn new(ip: &str, stage: AttemptStage, success: bool, failure_reason: Option<String>) -> Self {
        Self {
            ip_address: ip.to_string(),
            phone_number: None,
            success,
            stage,
            failure_reason,
            device: None,
            location: None,
            session_token: None,
            admin_id: None,
        }
    }

    /// Start from a resolved client; copies IP, device and location.
    pub fn from_client(client: &ClientInfo, stage: AttemptStage, failure: Option<&str>) -> Self {
        let mut attempt = Self::new(
            &client.ip,
            stage,
            failure.is_none(),
            failure.map(str::to_string),
        );
        attempt.device = client.device.clone();
        attempt.location = client.location.clone();
        attempt
    }

    pub fn phone(mut self, phone: &str) -> Self {
        self.phone_number = Some(phone.to_string());
        self
    }

    pub fn admin(mut self, admin_id: Uuid) -> Self {
        self.admin_id = Some(admin_id);
        self
    }

    pub fn session(mut self, session_token: &str) -> Self {
        self.session_token = Some(session_token.to_string());
        self
    }

    fn stamp(self, now: DateTime<Utc>) -> LoginAttempt {
        LoginAttempt {
            id: Uuid::new_v4(),
            ip_address: self.ip_address,
            phone_number: self.phone_number,
            success: self.success,
            stage: self.stage,
            failure_reason: self.failure_reason,
            device: self.device,
            location: self.location,
            session_token: self.session_token,
            admin_id: self.admin_id,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert(&self, attempt: &LoginAttempt) -> Result<(), StoreError>;

    /// Failures from `ip` since `since`, excluding recoverable ones.
    async fn count_failures_since(&self, ip: &str, since: DateTime<Utc>)
    -> Result<u64, StoreError>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<LoginAttempt>, StoreError>;

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryAttemptStore {
    entries: RwLock<Vec<LoginAttempt>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn insert(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(attempt.clone());
        Ok(())
    }

    async fn count_failures_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|a| !a.success && a.ip_address == ip && a.created_at >= since)
            .filter(|a| !a.failure_reason.as_deref().is_some_and(is_recoverable_failure))
            .count() as u64)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LoginAttempt>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|a| a.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

pub struct PgAttemptStore {
    db: Arc<Database>,
}

impl PgAttemptStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_attempt(row: &sqlx::postgres::PgRow) -> Result<LoginAttempt, StoreError> {
        let stage: String = row.require("stage")?;
        let device: Option<Json<Device>> = row.optional("device");
        let location: Option<Json<Location>> = row.optional("location");
        Ok(LoginAttempt {
            id: row.require("id")?,
            ip_address: row.require("ip_address")?,
            phone_number: row.optional("phone_number"),
            success: row.require("success")?,
            stage: stage.parse()?,
            failure_reason: row.optional("failure_reason"),
            device: device.map(|d| d.0),
            location: location.map(|l| l.0),
            session_token: row.optional("session_token"),
            admin_id: row.optional("admin_id"),
            created_at: row.require("created_at")?,
        })
    }
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    async fn insert(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts
                (id, ip_address, phone_number, success, stage, failure_reason,
                 device, location, session_token, admin_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.ip_address)
        .bind(attempt.phone_number.as_deref())
        .bind(attempt.success)
        .bind(attempt.stage.as_str())
        .bind(attempt.failure_reason.as_deref())
        .bind(attempt.device.as_ref().map(Json))
        .bind(attempt.location.as_ref().map(Json))
        .bind(attempt.session_token.as_deref())
        .bind(attempt.admin_id)
        .bind(attempt.created_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn count_failures_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS failures FROM login_attempts \
             WHERE ip_address = $1 AND NOT success AND created_at >= $2 \
             AND (failure_reason IS NULL OR NOT (failure_reason = ANY($3)))",
        )
        .bind(ip)
        .bind(since)
        .bind(&RECOVERABLE_FAILURES[..])
        .fetch_one(self.db.pool())
        .await?;
        let failures: i64 = row.require("failures")?;
        Ok(failures.max(0) as u64)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LoginAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, ip_address, phone_number, success, stage, failure_reason,
                   device, location, session_token, admin_id, created_at
            FROM login_attempts
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Attempt log service
// ============================================================================

pub struct AttemptLog {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
}

impl AttemptLog {
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append an entry. Audit write failures are logged, never surfaced.
    pub async fn record(&self, attempt: NewAttempt) {
        let attempt = attempt.stamp(self.clock.now());
        if attempt.success {
            tracing::debug!(
                ip = %attempt.ip_address,
                stage = attempt.stage.as_str(),
                "auth attempt succeeded"
            );
        } else {
            tracing::warn!(
                ip = %attempt.ip_address,
                stage = attempt.stage.as_str(),
                reason = attempt.failure_reason.as_deref().unwrap_or("-"),
                "auth attempt failed"
            );
        }
        if let Err(e) = self.store.insert(&attempt).await {
            tracing::error!("Failed to write attempt log entry: {}", e);
        }
    }

    /// Failed attempts from `ip` within the trailing `window`.
    pub async fn recent_failures(&self, ip: &str, window: Duration) -> Result<u64, StoreError> {
        self.store
            .count_failures_since(ip, self.clock.now() - window)
            .await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<LoginAttempt>, StoreError> {
        self.store.recent(limit).await
    }

    /// Drop entries past the retention period.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - Duration::days(ATTEMPT_RETENTION_DAYS);
        self.store.purge_before(cutoff).await
    }
}
