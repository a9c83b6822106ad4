//! One-time login codes.
//!
//! Codes are 6 digits, stored only as argon2 hashes, valid for 5 minutes and
//! for at most 5 verification tries. Issuing a new code for a phone replaces
//! the pending one.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;

use crate::clock::Clock;
use crate::security::SecurityError;

pub const OTP_TTL_MINUTES: i64 = 5;
pub const OTP_MAX_TRIES: u32 = 5;
const OTP_DIGITS: usize = 6;
// Codes live for minutes, so a light memory cost is enough.
const OTP_HASH_MEMORY_KIB: u32 = 4096;

/// Delivers a code to the admin's phone.
#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(&self, phone: &str, code: &str) -> anyhow::Result<()>;
}

/// Writes codes to the log. Outside production the code itself is logged.
pub struct LogOtpSender {
    production: bool,
}

impl LogOtpSender {
    pub fn new(production: bool) -> Self {
        Self { production }
    }
}

#[async_trait]
impl OtpSender for LogOtpSender {
    async fn send(&self, phone: &str, code: &str) -> anyhow::Result<()> {
        if self.production {
            tracing::info!(phone, "OTP issued");
        } else {
            tracing::info!(phone, code, "OTP issued (development delivery)");
        }
        Ok(())
    }
}

struct PendingOtp {
    hash: String,
    expires_at: DateTime<Utc>,
    tries_left: u32,
}

pub struct OtpIssuer {
    pending: DashMap<String, PendingOtp>,
    sender: Arc<dyn OtpSender>,
    clock: Arc<dyn Clock>,
    hasher: Argon2<'static>,
}

impl OtpIssuer {
    pub fn new(sender: Arc<dyn OtpSender>, clock: Arc<dyn Clock>) -> Self {
        let params = Params::new(OTP_HASH_MEMORY_KIB, 1, 1, None).unwrap_or_default();
        Self {
            pending: DashMap::new(),
            sender,
            clock,
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Generate, store and deliver a code for `phone` (already normalized).
    pub async fn issue(&self, phone: &str) -> Result<(), SecurityError> {
        let code = generate_code();
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher
            .hash_password(code.as_bytes(), &salt)
            .map_err(|e| SecurityError::Internal(format!("OTP hashing failed: {}", e)))?
            .to_string();

        self.pending.insert(
            phone.to_string(),
            PendingOtp {
                hash,
                expires_at: self.clock.now() + Duration::minutes(OTP_TTL_MINUTES),
                tries_left: OTP_MAX_TRIES,
            },
        );

        if let Err(e) = self.sender.send(phone, &code).await {
            self.pending.remove(phone);
            tracing::error!("OTP delivery to {} failed: {:#}", phone, e);
            return Err(SecurityError::Internal("OTP delivery failed".into()));
        }
        Ok(())
    }

    /// Consume the pending code for `phone` if `code` matches.
    ///
    /// Every failure is `OtpInvalid`; the reason is only logged.
    pub fn verify(&self, phone: &str, code: &str) -> Result<(), SecurityError> {
        let now = self.clock.now();
        let Some(mut pending) = self.pending.get_mut(phone) else {
            tracing::debug!(phone, "No pending OTP");
            return Err(SecurityError::OtpInvalid);
        };

        if pending.expires_at <= now || pending.tries_left == 0 {
            drop(pending);
            self.pending.remove(phone);
            tracing::debug!(phone, "OTP expired or exhausted");
            return Err(SecurityError::OtpInvalid);
        }

        let matches = PasswordHash::new(&pending.hash)
            .map(|parsed| {
                self.hasher
                    .verify_password(code.trim().as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);

        if matches {
            drop(pending);
            self.pending.remove(phone);
            return Ok(());
        }

        pending.tries_left -= 1;
        if pending.tries_left == 0 {
            drop(pending);
            self.pending.remove(phone);
        }
        Err(SecurityError::OtpInvalid)
    }

    /// Drop expired codes. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.pending.len();
        self.pending.retain(|_, p| p.expires_at > now);
        before - self.pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:0width$}", n, width = OTP_DIGITS)
}
