//! Per-IP sliding-window rate limiting.
//!
//! Each (limiter, ip) pair keeps the timestamps of its accepted requests
//! inside the window. Exceeding the OTP or login limiter escalates into the
//! IP reputation ledger so the offender stays out after the window rolls.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use super::attempt_log::{AttemptLog, AttemptStage, NewAttempt};
use super::error::SecurityError;
use super::ip_block::{BlockMetadata, BlockReason, IpReputation};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    OtpRequest,
    LoginVerify,
    GeneralApi,
}

/// Window, threshold and escalation for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub window: Duration,
    pub max_requests: usize,
    /// Block applied to the IP when the threshold is exceeded.
    pub escalation: Option<(Duration, BlockReason)>,
}

impl LimiterKind {
    pub fn policy(self) -> LimitPolicy {
        match self {
            Self::OtpRequest => LimitPolicy {
                window: Duration::minutes(15),
                max_requests: 3,
                escalation: Some((Duration::hours(1), BlockReason::RateLimit)),
            },
            Self::LoginVerify => LimitPolicy {
                window: Duration::minutes(15),
                max_requests: 5,
                escalation: Some((Duration::hours(2), BlockReason::BruteForce)),
            },
            Self::GeneralApi => LimitPolicy {
                window: Duration::minutes(1),
                max_requests: 1000,
                escalation: None,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtpRequest => "otp_request",
            Self::LoginVerify => "login_verify",
            Self::GeneralApi => "general_api",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after: Duration },
}

pub struct RateLimiter {
    windows: DashMap<(LimiterKind, String), VecDeque<DateTime<Utc>>>,
    ledger: Arc<IpReputation>,
    attempts: Arc<AttemptLog>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(ledger: Arc<IpReputation>, attempts: Arc<AttemptLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            ledger,
            attempts,
            clock,
        }
    }

    /// Count one request against the window. Rejected requests are not counted.
    pub fn check(&self, kind: LimiterKind, ip: &str) -> RateDecision {
        let policy = kind.policy();
        let now = self.clock.now();
        let cutoff = now - policy.window;

        let mut hits = self.windows.entry((kind, ip.to_string())).or_default();
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }

        if hits.len() >= policy.max_requests {
            let retry_after = hits
                .front()
                .map(|oldest| *oldest + policy.window - now)
                .unwrap_or(policy.window);
            return RateDecision::Limited { retry_after };
        }

        hits.push_back(now);
        RateDecision::Allowed {
            remaining: policy.max_requests - hits.len(),
        }
    }

    /// Check and, on violation, escalate and reject.
    pub async fn enforce(&self, kind: LimiterKind, ip: &str) -> Result<(), SecurityError> {
        if self.ledger.is_local_bypass(ip) {
            return Ok(());
        }

        let retry_after = match self.check(kind, ip) {
            RateDecision::Allowed { .. } => return Ok(()),
            RateDecision::Limited { retry_after } => retry_after,
        };

        tracing::warn!(
            ip = %ip,
            limiter = kind.as_str(),
            retry_after_secs = retry_after.num_seconds(),
            "rate limit exceeded"
        );

        if let Some((duration, reason)) = kind.policy().escalation {
            let metadata = BlockMetadata::attack(
                kind.as_str(),
                serde_json::json!({ "limiter": kind.as_str(), "threshold": kind.policy().max_requests }),
            );
            if let Err(e) = self
                .ledger
                .block_ip(ip, reason, metadata, Some(duration))
                .await
            {
                tracing::error!("Failed to escalate rate-limit violation for {}: {}", ip, e);
            }
        }

        self.attempts
            .record(NewAttempt::failure(
                ip,
                AttemptStage::RateLimited,
                kind.as_str(),
            ))
            .await;

        Err(SecurityError::RateLimited)
    }

    /// Drop windows with no hits left inside them. Returns keys removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|(kind, _), hits| {
            let cutoff = now - kind.policy().window;
            hits.back().is_some_and(|t| *t > cutoff)
        });
        before - self.windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
