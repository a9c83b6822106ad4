//! IP reputation ledger.
//!
//! One record per offending IP. Re-blocking the same IP is a single atomic
//! upsert that bumps `attempt_count`, so concurrent blockers accumulate
//! instead of overwriting each other.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{Database, SafeRow, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimit,
    BruteForce,
    SuspiciousActivity,
    Manual,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::BruteForce => "brute_force",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for BlockReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(Self::RateLimit),
            "brute_force" => Ok(Self::BruteForce),
            "suspicious_activity" => Ok(Self::SuspiciousActivity),
            "manual" => Ok(Self::Manual),
            other => Err(StoreError::Corrupt(format!("unknown block reason '{}'", other))),
        }
    }
}

/// Extra context stored with a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub attack_type: Option<String>,
    pub details: serde_json::Value,
}

impl BlockMetadata {
    pub fn attack(attack_type: &str, details: serde_json::Value) -> Self {
        Self {
            attack_type: Some(attack_type.to_string()),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedIp {
    pub ip_address: String,
    pub reason: BlockReason,
    pub blocked_at: DateTime<Utc>,
    /// `None` is a permanent block that needs manual clearance.
    pub expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_attempt_at: DateTime<Utc>,
    pub attack_type: Option<String>,
    pub is_active: bool,
    pub metadata: serde_json::Value,
}

impl BlockedIp {
    pub fn is_blocking(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|exp| exp > now)
    }

    /// Expiry after re-blocking at `now`. A block still in force is never
    /// shortened: permanent stays permanent, otherwise the later expiry wins.
    pub fn extended_expiry(
        &self,
        now: DateTime<Utc>,
        requested: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if !self.is_blocking(now) {
            return requested;
        }
        match (self.expires_at, requested) {
            (Some(current), Some(requested)) => Some(current.max(requested)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait IpBlockStore: Send + Sync {
    /// The block for `ip` if it is active and unexpired at `now`.
    async fn find_active(&self, ip: &str, now: DateTime<Utc>)
    -> Result<Option<BlockedIp>, StoreError>;

    /// Insert or refresh the block for `ip`, incrementing its attempt counter.
    async fn upsert_block(
        &self,
        ip: &str,
        reason: BlockReason,
        metadata: &BlockMetadata,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlockedIp, StoreError>;

    /// Soft-clear. Returns whether an active block was cleared.
    async fn deactivate(&self, ip: &str) -> Result<bool, StoreError>;

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlockedIp>, StoreError>;

    /// Hard-delete blocks whose expiry has passed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryIpBlockStore {
    blocks: DashMap<String, BlockedIp>,
}

impl MemoryIpBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IpBlockStore for MemoryIpBlockStore {
    async fn find_active(
        &self,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockedIp>, StoreError> {
        Ok(self
            .blocks
            .get(ip)
            .filter(|b| b.is_blocking(now))
            .map(|b| b.clone()))
    }

    async fn upsert_block(
        &self,
        ip: &str,
        reason: BlockReason,
        metadata: &BlockMetadata,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlockedIp, StoreError> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let record = match self.blocks.entry(ip.to_string()) {
            Entry::Occupied(mut e) => {
                let b = e.get_mut();
                b.expires_at = b.extended_expiry(now, expires_at);
                b.reason = reason;
                b.blocked_at = now;
                b.attempt_count += 1;
                b.last_attempt_at = now;
                b.attack_type = metadata.attack_type.clone();
                b.is_active = true;
                b.metadata = metadata.details.clone();
                b.clone()
            }
            Entry::Vacant(v) => v
                .insert(BlockedIp {
                    ip_address: ip.to_string(),
                    reason,
                    blocked_at: now,
                    expires_at,
                    attempt_count: 1,
                    last_attempt_at: now,
                    attack_type: metadata.attack_type.clone(),
                    is_active: true,
                    metadata: metadata.details.clone(),
                })
                .clone(),
        };
        Ok(record)
    }

    async fn deactivate(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(match self.blocks.get_mut(ip) {
            Some(mut b) if b.is_active => {
                b.is_active = false;
                true
            }
            _ => false,
        })
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlockedIp>, StoreError> {
        let mut out: Vec<BlockedIp> = self
            .blocks
            .iter()
            .filter(|b| b.is_blocking(now))
            .map(|b| b.clone())
            .collect();
        out.sort_by(|a, b| b.blocked_at.cmp(&a.blocked_at));
        Ok(out)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.blocks.len();
        self.blocks
            .retain(|_, b| b.expires_at.is_none_or(|exp| exp > now));
        Ok((before - self.blocks.len()) as u64)
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

const BLOCK_COLUMNS: &str = "ip_address, reason, blocked_at, expires_at, attempt_count, \
     last_attempt_at, attack_type, is_active, metadata";

pub struct PgIpBlockStore {
    db: Arc<Database>,
}

impl PgIpBlockStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_block(row: &sqlx::postgres::PgRow) -> Result<BlockedIp, StoreError> {
        let reason: String = row.require("reason")?;
        Ok(BlockedIp {
            ip_address: row.require("ip_address")?,
            reason: reason.parse()?,
            blocked_at: row.require("blocked_at")?,
            expires_at: row.optional("expires_at"),
            attempt_count: row.require("attempt_count")?,
            last_attempt_at: row.require("last_attempt_at")?,
            attack_type: row.optional("attack_type"),
            is_active: row.require("is_active")?,
            metadata: row
                .try_get_log("metadata")
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl IpBlockStore for PgIpBlockStore {
    async fn find_active(
        &self,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockedIp>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocked_ips \
             WHERE ip_address = $1 AND is_active AND (expires_at IS NULL OR expires_at > $2)"
        ))
        .bind(ip)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(Self::row_to_block).transpose()
    }

    async fn upsert_block(
        &self,
        ip: &str,
        reason: BlockReason,
        metadata: &BlockMetadata,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlockedIp, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO blocked_ips
                (ip_address, reason, blocked_at, expires_at, attempt_count,
                 last_attempt_at, attack_type, is_active, metadata)
            VALUES ($1, $2, $3, $4, 1, $3, $5, TRUE, $6)
            ON CONFLICT (ip_address) DO UPDATE SET
                reason = EXCLUDED.reason,
                blocked_at = EXCLUDED.blocked_at,
                expires_at = CASE
                    WHEN blocked_ips.is_active
                         AND (blocked_ips.expires_at IS NULL OR blocked_ips.expires_at > $3)
                    THEN CASE
                        WHEN blocked_ips.expires_at IS NULL OR EXCLUDED.expires_at IS NULL THEN NULL
                        ELSE GREATEST(blocked_ips.expires_at, EXCLUDED.expires_at)
                    END
                    ELSE EXCLUDED.expires_at
                END,
                attempt_count = blocked_ips.attempt_count + 1,
                last_attempt_at = EXCLUDED.last_attempt_at,
                attack_type = EXCLUDED.attack_type,
                is_active = TRUE,
                metadata = EXCLUDED.metadata
            RETURNING {BLOCK_COLUMNS}
            "#
        ))
        .bind(ip)
        .bind(reason.as_str())
        .bind(now)
        .bind(expires_at)
        .bind(metadata.attack_type.as_deref())
        .bind(&metadata.details)
        .fetch_one(self.db.pool())
        .await?;

        Self::row_to_block(&row)
    }

    async fn deactivate(&self, ip: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE blocked_ips SET is_active = FALSE WHERE ip_address = $1 AND is_active")
                .bind(ip)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BlockedIp>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocked_ips \
             WHERE is_active AND (expires_at IS NULL OR expires_at > $1) \
             ORDER BY blocked_at DESC"
        ))
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_block).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM blocked_ips WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Ledger
// ============================================================================

const LOCAL_ADDRESSES: [&str; 4] = ["127.0.0.1", "::1", "::ffff:127.0.0.1", "localhost"];

pub struct IpReputation {
    store: Arc<dyn IpBlockStore>,
    clock: Arc<dyn Clock>,
    production: bool,
}

impl IpReputation {
    pub fn new(store: Arc<dyn IpBlockStore>, clock: Arc<dyn Clock>, production: bool) -> Self {
        Self {
            store,
            clock,
            production,
        }
    }

    /// Outside production, localhost is never blocked or rate limited.
    pub fn is_local_bypass(&self, ip: &str) -> bool {
        !self.production && LOCAL_ADDRESSES.contains(&ip)
    }

    /// Fails open: a store outage must not lock out legitimate traffic.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        if self.is_local_bypass(ip) {
            return false;
        }
        match self.store.find_active(ip, self.clock.now()).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::error!("IP block lookup failed for {}, allowing: {}", ip, e);
                false
            }
        }
    }

    /// `duration = None` blocks until manually cleared.
    pub async fn block_ip(
        &self,
        ip: &str,
        reason: BlockReason,
        metadata: BlockMetadata,
        duration: Option<Duration>,
    ) -> Result<BlockedIp, StoreError> {
        let now = self.clock.now();
        let expires_at = duration.map(|d| now + d);
        let record = self
            .store
            .upsert_block(ip, reason, &metadata, now, expires_at)
            .await?;
        tracing::warn!(
            ip = %ip,
            reason = reason.as_str(),
            attempt_count = record.attempt_count,
            expires_at = ?record.expires_at,
            "IP blocked"
        );
        Ok(record)
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<bool, StoreError> {
        let cleared = self.store.deactivate(ip).await?;
        if cleared {
            tracing::info!(ip = %ip, "IP block cleared");
        }
        Ok(cleared)
    }

    pub async fn list_active(&self) -> Result<Vec<BlockedIp>, StoreError> {
        self.store.list_active(self.clock.now()).await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired(self.clock.now()).await
    }
}
