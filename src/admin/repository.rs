//! Admin record storage.
//!
//! Uses runtime queries to avoid sqlx compile-time database connection.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sqlx::types::Json;
use std::sync::Arc;
use uuid::Uuid;

use super::models::{Admin, LOGIN_HISTORY_LIMIT, LoginEntry, push_bounded};
use crate::db::{Database, SafeRow, StoreError};

#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<Admin>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Admin>, StoreError>;

    /// Fails with `StoreError::Duplicate` if the phone is already registered.
    async fn insert(&self, admin: &Admin) -> Result<(), StoreError>;

    /// Set last-login fields and append to the bounded history.
    async fn record_login(&self, id: Uuid, entry: &LoginEntry) -> Result<(), StoreError>;

    /// Returns whether a record was updated.
    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Keyed by phone number.
#[derive(Default)]
pub struct MemoryAdminStore {
    admins: DashMap<String, Admin>,
}

impl MemoryAdminStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdminStore for MemoryAdminStore {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<Admin>, StoreError> {
        Ok(self.admins.get(phone).map(|a| a.clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Admin>, StoreError> {
        Ok(self
            .admins
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.clone()))
    }

    async fn insert(&self, admin: &Admin) -> Result<(), StoreError> {
        match self.admins.entry(admin.phone_number.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(admin.phone_number.clone())),
            Entry::Vacant(v) => {
                v.insert(admin.clone());
                Ok(())
            }
        }
    }

    async fn record_login(&self, id: Uuid, entry: &LoginEntry) -> Result<(), StoreError> {
        if let Some(mut admin) = self.admins.iter_mut().find(|a| a.id == id) {
            admin.last_login_at = Some(entry.at);
            admin.last_login_ip = Some(entry.ip_address.clone());
            push_bounded(&mut admin.login_history, entry.clone());
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        Ok(match self.admins.iter_mut().find(|a| a.id == id) {
            Some(mut admin) => {
                admin.is_active = active;
                true
            }
            None => false,
        })
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

const ADMIN_COLUMNS: &str = "id, phone_number, name, provider_uid, role, key_seed, is_active, \
     last_login_at, last_login_ip, login_history, created_at";

pub struct PgAdminStore {
    db: Arc<Database>,
}

impl PgAdminStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_admin(row: &sqlx::postgres::PgRow) -> Result<Admin, StoreError> {
        let role: String = row.require("role")?;
        let history: Json<Vec<LoginEntry>> = row.require("login_history")?;
        Ok(Admin {
            id: row.require("id")?,
            phone_number: row.require("phone_number")?,
            name: row.require("name")?,
            provider_uid: row.optional("provider_uid"),
            role: role.parse()?,
            key_seed: row.require("key_seed")?,
            is_active: row.require("is_active")?,
            last_login_at: row.optional("last_login_at"),
            last_login_ip: row.optional("last_login_ip"),
            login_history: history.0,
            created_at: row.require("created_at")?,
        })
    }
}

#[async_trait]
impl AdminStore for PgAdminStore {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<Admin>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ADMIN_COLUMNS} FROM admins WHERE phone_number = $1"
        ))
        .bind(phone)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(Self::row_to_admin).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Admin>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(Self::row_to_admin).transpose()
    }

    async fn insert(&self, admin: &Admin) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO admins
                (id, phone_number, name, provider_uid, role, key_seed, is_active,
                 last_login_at, last_login_ip, login_history, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(admin.id)
        .bind(&admin.phone_number)
        .bind(&admin.name)
        .bind(admin.provider_uid.as_deref())
        .bind(admin.role.as_str())
        .bind(&admin.key_seed)
        .bind(admin.is_active)
        .bind(admin.last_login_at)
        .bind(admin.last_login_ip.as_deref())
        .bind(Json(&admin.login_history))
        .bind(admin.created_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| StoreError::from_insert(e, &admin.phone_number))?;
        Ok(())
    }

    async fn record_login(&self, id: Uuid, entry: &LoginEntry) -> Result<(), StoreError> {
        // Append then keep the newest LOGIN_HISTORY_LIMIT elements, in order.
        sqlx::query(
            r#"
            UPDATE admins SET
                last_login_at = $2,
                last_login_ip = $3,
                login_history = (
                    SELECT COALESCE(jsonb_agg(e ORDER BY i), '[]'::jsonb)
                    FROM (
                        SELECT e, i
                        FROM jsonb_array_elements(login_history || jsonb_build_array($4::jsonb))
                             WITH ORDINALITY AS t(e, i)
                        ORDER BY i DESC
                        LIMIT $5
                    ) recent
                )
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(entry.at)
        .bind(&entry.ip_address)
        .bind(Json(entry))
        .bind(LOGIN_HISTORY_LIMIT as i64)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE admins SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_memory_insert_is_unique_by_phone() {
        let store = MemoryAdminStore::new();
        let now = Utc::now();
        store
            .insert(&Admin::new("+919876543210", "A", now))
            .await
            .unwrap();
        let dup = store.insert(&Admin::new("+919876543210", "B", now)).await;
        assert!(matches!(dup, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_memory_record_login_and_deactivate() {
        let store = MemoryAdminStore::new();
        let now = Utc::now();
        let admin = Admin::new("+919876543210", "A", now);
        store.insert(&admin).await.unwrap();

        store
            .record_login(
                admin.id,
                &LoginEntry {
                    at: now,
                    ip_address: "10.1.1.1".into(),
                    device: Some("Chrome on Android".into()),
                },
            )
            .await
            .unwrap();
        assert!(store.set_active(admin.id, false).await.unwrap());

        let loaded = store.find_by_id(admin.id).await.unwrap().unwrap();
        assert!(!loaded.is_active);
        assert_eq!(loaded.login_history.len(), 1);
        assert_eq!(loaded.last_login_ip.as_deref(), Some("10.1.1.1"));
        assert!(!store.set_active(Uuid::new_v4(), false).await.unwrap());
    }
}
