//! Failure-count escalation.
//!
//! Independent of the rate limiter: the limiter counts requests, this counts
//! failed outcomes recorded in the attempt log.

use chrono::Duration;
use std::sync::Arc;

use super::attempt_log::AttemptLog;
use super::ip_block::{BlockMetadata, BlockReason, IpReputation};

pub const SUSPICIOUS_WINDOW_MINUTES: i64 = 15;
pub const SUSPICIOUS_FAILURE_THRESHOLD: u64 = 5;
pub const SUSPICIOUS_BLOCK_MINUTES: i64 = 30;

pub struct SuspiciousActivityEscalator {
    attempts: Arc<AttemptLog>,
    ledger: Arc<IpReputation>,
}

impl SuspiciousActivityEscalator {
    pub fn new(attempts: Arc<AttemptLog>, ledger: Arc<IpReputation>) -> Self {
        Self { attempts, ledger }
    }

    /// Blocks `ip` for 30 minutes once it has 5 failures in the last 15.
    /// Returns whether a block was placed.
    pub async fn check_suspicious_activity(&self, ip: &str) -> bool {
        if self.ledger.is_local_bypass(ip) {
            return false;
        }

        let failures = match self
            .attempts
            .recent_failures(ip, Duration::minutes(SUSPICIOUS_WINDOW_MINUTES))
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to count recent failures for {}: {}", ip, e);
                return false;
            }
        };

        if failures < SUSPICIOUS_FAILURE_THRESHOLD {
            return false;
        }

        let metadata = BlockMetadata::attack(
            "repeated_failures",
            serde_json::json!({
                "failures": failures,
                "window_minutes": SUSPICIOUS_WINDOW_MINUTES,
            }),
        );
        match self
            .ledger
            .block_ip(
                ip,
                BlockReason::BruteForce,
                metadata,
                Some(Duration::minutes(SUSPICIOUS_BLOCK_MINUTES)),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to block suspicious IP {}: {}", ip, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::security::attempt_log::{AttemptStage, MemoryAttemptStore, NewAttempt};
    use crate::security::ip_block::MemoryIpBlockStore;

    const IP: &str = "192.0.2.77";

    fn setup() -> (
        SuspiciousActivityEscalator,
        Arc<AttemptLog>,
        Arc<IpReputation>,
        Arc<ManualClock>,
    ) {
        let clock = Arc::new(ManualClock::starting_now());
        let attempts = Arc::new(AttemptLog::new(
            Arc::new(MemoryAttemptStore::new()),
            clock.clone(),
        ));
        let ledger = Arc::new(IpReputation::new(
            Arc::new(MemoryIpBlockStore::new()),
            clock.clone(),
            true,
        ));
        (
            SuspiciousActivityEscalator::new(attempts.clone(), ledger.clone()),
            attempts,
            ledger,
            clock,
        )
    }

    async fn fail(attempts: &AttemptLog) {
        attempts
            .record(NewAttempt::failure(IP, AttemptStage::OtpVerify, "otp_mismatch"))
            .await;
    }

    #[tokio::test]
    async fn test_five_failures_block_for_thirty_minutes() {
        let (escalator, attempts, ledger, clock) = setup();
        for _ in 0..4 {
            fail(&attempts).await;
            assert!(!escalator.check_suspicious_activity(IP).await);
        }
        fail(&attempts).await;
        assert!(escalator.check_suspicious_activity(IP).await);
        assert!(ledger.is_blocked(IP).await);

        let block = &ledger.list_active().await.unwrap()[0];
        assert_eq!(block.reason, BlockReason::BruteForce);

        clock.advance(Duration::minutes(29));
        assert!(ledger.is_blocked(IP).await);
        clock.advance(Duration::minutes(2));
        assert!(!ledger.is_blocked(IP).await);
    }

    #[tokio::test]
    async fn test_old_failures_do_not_count() {
        let (escalator, attempts, ledger, clock) = setup();
        for _ in 0..4 {
            fail(&attempts).await;
        }
        clock.advance(Duration::minutes(16));
        fail(&attempts).await;
        assert!(!escalator.check_suspicious_activity(IP).await);
        assert!(!ledger.is_blocked(IP).await);
    }

    #[tokio::test]
    async fn test_successes_do_not_count() {
        let (escalator, attempts, _, _) = setup();
        for _ in 0..10 {
            attempts
                .record(NewAttempt::success(IP, AttemptStage::AdminLogin))
                .await;
        }
        assert!(!escalator.check_suspicious_activity(IP).await);
    }
}
