//! Sweeper - periodic cleanup of expired security state
//!
//! Runs in the gateway's tokio runtime. Process-local caches (nonces,
//! rate-limit windows, pending OTP codes) are swept in place; persistent
//! records (sessions, IP blocks, attempt log) are purged through their
//! stores.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

use crate::gateway::AppState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub nonces: usize,
    pub rate_windows: usize,
    pub otp_codes: usize,
    pub sessions: u64,
    pub ip_blocks: u64,
    pub attempts: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Sweeper {
    state: Arc<AppState>,
    period: Duration,
}

impl Sweeper {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            period: SWEEP_INTERVAL,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run forever. Spawn on the runtime.
    pub async fn run(self) {
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("[Sweeper] Started - every {:?}", self.period);

        loop {
            tick.tick().await;
            let report = self.sweep_once().await;
            if !report.is_empty() {
                tracing::debug!(?report, "[Sweeper] Pass complete");
            }
        }
    }

    /// One pass. Store failures are logged and do not stop the pass.
    pub async fn sweep_once(&self) -> SweepReport {
        let state = &self.state;
        let mut report = SweepReport {
            nonces: state.replay.sweep(),
            rate_windows: state.limiter.sweep(),
            otp_codes: state.otp.sweep(),
            ..SweepReport::default()
        };

        match state.sessions.purge_expired().await {
            Ok(n) => report.sessions = n,
            Err(e) => tracing::error!("[Sweeper] Session purge failed: {}", e),
        }
        match state.ledger.purge_expired().await {
            Ok(n) => report.ip_blocks = n,
            Err(e) => tracing::error!("[Sweeper] IP block purge failed: {}", e),
        }
        match state.attempts.purge_expired().await {
            Ok(n) => report.attempts = n,
            Err(e) => tracing::error!("[Sweeper] Attempt log purge failed: {}", e),
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::SecurityConfig;
    use crate::db::DataConnections;
    use crate::gateway::Stores;
    use crate::otp::LogOtpSender;
    use chrono::Duration as ChronoDuration;

    fn state(clock: Arc<ManualClock>) -> Arc<AppState> {
        let config = SecurityConfig {
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            communication_secret: "shared-secret".to_string(),
            admin_whitelist: vec!["+919876543210".to_string()],
            ..SecurityConfig::default()
        };
        Arc::new(AppState::new(
            &config,
            Stores::memory(),
            DataConnections::default(),
            Arc::new(LogOtpSender::new(false)),
            clock,
        ))
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_state() {
        let clock = Arc::new(ManualClock::starting_now());
        let state = state(clock.clone());

        state.otp.issue("+919876543210").await.unwrap();
        let now = clock.now();
        state
            .replay
            .check(now.timestamp_millis(), "nonce-1")
            .unwrap();
        let session = state
            .sessions
            .create_session(
                uuid::Uuid::new_v4(),
                "signed.token.value",
                Default::default(),
            )
            .await
            .unwrap();

        let sweeper = Sweeper::new(state.clone());
        let report = sweeper.sweep_once().await;
        assert_eq!(report.otp_codes, 0);
        assert_eq!(report.nonces, 0);
        assert_eq!(report.sessions, 0);

        clock.advance(ChronoDuration::hours(1));
        let report = sweeper.sweep_once().await;
        assert_eq!(report.otp_codes, 1);
        assert_eq!(report.nonces, 1);
        assert_eq!(report.sessions, 1);
        assert_eq!(state.otp.pending(), 0);
        assert!(state.replay.is_empty());
        assert!(
            state
                .sessions
                .list_active_sessions(session.admin_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_empty_report() {
        assert!(SweepReport::default().is_empty());
        let report = SweepReport {
            nonces: 1,
            ..SweepReport::default()
        };
        assert!(!report.is_empty());
    }
}
