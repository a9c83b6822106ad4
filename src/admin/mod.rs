//! Credential store: admin identities keyed by phone number.
//!
//! An admin may log in only if their phone is whitelisted, either in the
//! configured set or by an existing active record. The record itself is
//! created on the first successful verification.

pub mod models;
pub mod phone;
pub mod repository;

pub use models::{Admin, AdminRole, LOGIN_HISTORY_LIMIT, LoginEntry};
pub use phone::normalize_phone;
pub use repository::{AdminStore, MemoryAdminStore, PgAdminStore};

use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::StoreError;
use crate::security::SecurityError;

pub struct CredentialStore {
    store: Arc<dyn AdminStore>,
    whitelist: HashSet<String>,
    default_country_code: String,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    /// Whitelist entries that do not normalize are logged and skipped.
    pub fn new(
        store: Arc<dyn AdminStore>,
        whitelist: &[String],
        default_country_code: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let whitelist = whitelist
            .iter()
            .filter_map(|raw| match normalize_phone(raw, default_country_code) {
                Ok(phone) => Some(phone),
                Err(e) => {
                    tracing::warn!("Ignoring whitelist entry '{}': {}", raw, e);
                    None
                }
            })
            .collect();
        Self {
            store,
            whitelist,
            default_country_code: default_country_code.to_string(),
            clock,
        }
    }

    pub fn normalize(&self, raw: &str) -> Result<String, SecurityError> {
        normalize_phone(raw, &self.default_country_code)
    }

    /// `phone` must already be normalized.
    pub async fn is_whitelisted(&self, phone: &str) -> Result<bool, StoreError> {
        if self.whitelist.contains(phone) {
            return Ok(true);
        }
        Ok(self
            .store
            .find_by_phone(phone)
            .await?
            .is_some_and(|a| a.is_active))
    }

    pub async fn find_by_phone(&self, phone: &str) -> Result<Option<Admin>, StoreError> {
        self.store.find_by_phone(phone).await
    }

    pub async fn find_by_id(&self, id: uuid::Uuid) -> Result<Option<Admin>, StoreError> {
        self.store.find_by_id(id).await
    }

    /// Load the admin for a verified phone, creating the record on first login.
    pub async fn find_or_create(&self, phone: &str, name: Option<&str>) -> Result<Admin, SecurityError> {
        if !self.is_whitelisted(phone).await? {
            return Err(SecurityError::NotWhitelisted);
        }

        let admin = match self.store.find_by_phone(phone).await? {
            Some(existing) => existing,
            None => {
                let display = name.map(str::trim).filter(|n| !n.is_empty()).unwrap_or("Admin");
                let admin = Admin::new(phone, display, self.clock.now());
                match self.store.insert(&admin).await {
                    Ok(()) => {
                        tracing::info!(admin_id = %admin.id, "Admin record created");
                        admin
                    }
                    // Concurrent first login won the insert.
                    Err(StoreError::Duplicate(_)) => self
                        .store
                        .find_by_phone(phone)
                        .await?
                        .ok_or_else(|| SecurityError::Internal("admin vanished after insert race".into()))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if !admin.is_active {
            return Err(SecurityError::AdminDeactivated);
        }
        Ok(admin)
    }

    pub async fn record_login(&self, admin: &mut Admin, entry: LoginEntry) -> Result<(), StoreError> {
        self.store.record_login(admin.id, &entry).await?;
        admin.record_login(entry);
        Ok(())
    }

    /// Deactivate (never delete) the admin owning `phone`.
    pub async fn deactivate(&self, phone: &str) -> Result<Admin, SecurityError> {
        let mut admin = self
            .store
            .find_by_phone(phone)
            .await?
            .ok_or(SecurityError::NotFound)?;
        self.store.set_active(admin.id, false).await?;
        admin.is_active = false;
        tracing::warn!(admin_id = %admin.id, "Admin deactivated");
        Ok(admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const LISTED: &str = "+919876543210";

    fn credentials() -> CredentialStore {
        CredentialStore::new(
            Arc::new(MemoryAdminStore::new()),
            &["98765 43210".to_string(), "garbage".to_string()],
            "91",
            Arc::new(ManualClock::starting_now()),
        )
    }

    #[tokio::test]
    async fn test_whitelist_is_normalized() {
        let creds = credentials();
        assert!(creds.is_whitelisted(LISTED).await.unwrap());
        assert!(!creds.is_whitelisted("+919000000000").await.unwrap());
    }

    #[tokio::test]
    async fn test_first_login_creates_then_reuses() {
        let creds = credentials();
        let first = creds.find_or_create(LISTED, Some("Asha")).await.unwrap();
        let second = creds.find_or_create(LISTED, Some("Other")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Asha");
    }

    #[tokio::test]
    async fn test_unlisted_phone_rejected() {
        let creds = credentials();
        assert_eq!(
            creds.find_or_create("+919000000000", None).await.unwrap_err(),
            SecurityError::NotWhitelisted
        );
    }

    #[tokio::test]
    async fn test_deactivated_admin_cannot_log_in() {
        let creds = credentials();
        creds.find_or_create(LISTED, None).await.unwrap();
        let admin = creds.deactivate(LISTED).await.unwrap();
        assert!(!admin.is_active);

        // Still whitelisted by configuration, but the record is disabled.
        assert_eq!(
            creds.find_or_create(LISTED, None).await.unwrap_err(),
            SecurityError::AdminDeactivated
        );
        assert_eq!(
            creds.deactivate("+919000000000").await.unwrap_err(),
            SecurityError::NotFound
        );
    }
}
