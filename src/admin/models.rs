//! Admin identity records.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::StoreError;

/// Entries kept in `Admin::login_history`.
pub const LOGIN_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Admin,
}

impl AdminRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
        }
    }
}

impl FromStr for AdminRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            other => Err(StoreError::Corrupt(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LoginEntry {
    pub at: DateTime<Utc>,
    pub ip_address: String,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub id: Uuid,
    /// E.164, the only stable lookup key.
    pub phone_number: String,
    pub name: String,
    pub provider_uid: Option<String>,
    pub role: AdminRole,
    /// Per-admin symmetric key seed. Never leaves the server.
    #[serde(skip_serializing)]
    pub key_seed: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub login_history: Vec<LoginEntry>,
    pub created_at: DateTime<Utc>,
}

impl Admin {
    pub fn new(phone_number: &str, name: &str, now: DateTime<Utc>) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            id: Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            name: name.to_string(),
            provider_uid: None,
            role: AdminRole::Admin,
            key_seed: hex::encode(seed),
            is_active: true,
            last_login_at: None,
            last_login_ip: None,
            login_history: Vec::new(),
            created_at: now,
        }
    }

    /// Append to the bounded history, dropping the oldest entries.
    pub fn record_login(&mut self, entry: LoginEntry) {
        self.last_login_at = Some(entry.at);
        self.last_login_ip = Some(entry.ip_address.clone());
        push_bounded(&mut self.login_history, entry);
    }
}

pub(crate) fn push_bounded(history: &mut Vec<LoginEntry>, entry: LoginEntry) {
    history.push(entry);
    if history.len() > LOGIN_HISTORY_LIMIT {
        let excess = history.len() - LOGIN_HISTORY_LIMIT;
        history.drain(..excess);
    }
}
