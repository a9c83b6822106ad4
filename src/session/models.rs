use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::StoreError;
use crate::security::{Device, Location, SessionRejection};

/// Why a session stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    Logout,
    NewSessionCreated,
    SecurityRevocation,
    AdminDeactivated,
    Expired,
}

impl RevokeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::NewSessionCreated => "new_session_created",
            Self::SecurityRevocation => "security_revocation",
            Self::AdminDeactivated => "admin_deactivated",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for RevokeReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(Self::Logout),
            "new_session_created" => Ok(Self::NewSessionCreated),
            "security_revocation" => Ok(Self::SecurityRevocation),
            "admin_deactivated" => Ok(Self::AdminDeactivated),
            "expired" => Ok(Self::Expired),
            other => Err(StoreError::Corrupt(format!("unknown revoke reason '{}'", other))),
        }
    }
}

/// Client snapshot captured when the session is created.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub ip_address: String,
    pub device: Option<Device>,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub admin_id: Uuid,
    pub session_token: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub ip_address: String,
    pub device: Option<Device>,
    pub location: Option<Location>,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<RevokeReason>,
}

impl Session {
    /// Checks in order: active, unexpired, bound to the presented token.
    pub fn check(&self, token_hash: &str, now: DateTime<Utc>) -> Result<(), SessionRejection> {
        if !self.is_active {
            return Err(SessionRejection::Inactive);
        }
        if now >= self.expires_at {
            return Err(SessionRejection::Expired);
        }
        if !constant_time_eq(&self.token_hash, token_hash) {
            return Err(SessionRejection::TokenMismatch);
        }
        Ok(())
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

/// 32 random bytes, hex encoded.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(now: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4(),
            admin_id: Uuid::new_v4(),
            session_token: generate_session_token(),
            token_hash: "h".into(),
            ip_address: "10.0.0.1".into(),
            device: None,
            location: None,
            is_active: true,
            last_activity: now,
            expires_at: now + Duration::minutes(30),
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        }
    }

    #[test]
    fn test_token_shape() {
        let token = generate_session_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_session_token());
    }

    #[test]
    fn test_check_order() {
        let now = Utc::now();
        let mut s = session(now);
        assert_eq!(s.check("h", now), Ok(()));
        assert_eq!(s.check("other", now), Err(SessionRejection::TokenMismatch));
        assert_eq!(
            s.check("h", now + Duration::minutes(30)),
            Err(SessionRejection::Expired)
        );
        s.is_active = false;
        assert_eq!(s.check("other", now), Err(SessionRejection::Inactive));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc123", "abc12"));
        assert!(constant_time_eq("", ""));

        let now = Utc::now();
        let s = session(now);
        assert_eq!(s.check("g", now), Err(SessionRejection::TokenMismatch));
    }

    #[test]
    fn test_revoke_reason_names() {
        for reason in [
            RevokeReason::Logout,
            RevokeReason::NewSessionCreated,
            RevokeReason::SecurityRevocation,
            RevokeReason::AdminDeactivated,
            RevokeReason::Expired,
        ] {
            assert_eq!(reason.as_str().parse::<RevokeReason>().unwrap(), reason);
        }
    }
}
