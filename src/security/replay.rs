//! Nonce store for replay attack prevention.
//!
//! A request that carries `X-Request-Timestamp` and `X-Request-Nonce` must be
//! fresh (within 5 minutes of server time) and its nonce unseen. Accepted
//! nonces are remembered until the validity window passes.
//!
//! The cache is process-local: it does not survive a restart and is not
//! shared between instances.

use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

use super::error::SecurityError;
use crate::clock::Clock;

pub const TIMESTAMP_HEADER: &str = "x-request-timestamp";
pub const NONCE_HEADER: &str = "x-request-nonce";
pub const REPLAY_WINDOW_MINUTES: i64 = 5;
const MAX_NONCE_LEN: usize = 128;

/// Thread-safe nonce cache. Values are the instant each nonce may be forgotten.
pub struct ReplayGuard {
    seen: DashMap<String, DateTime<Utc>>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl ReplayGuard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: DashMap::new(),
            window: Duration::minutes(REPLAY_WINDOW_MINUTES),
            clock,
        }
    }

    /// Validate a (timestamp, nonce) pair and consume the nonce.
    ///
    /// `timestamp_ms` is milliseconds since the Unix epoch.
    pub fn check(&self, timestamp_ms: i64, nonce: &str) -> Result<(), SecurityError> {
        let now = self.clock.now();
        let sent_at = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .ok_or_else(|| SecurityError::RequestInvalid("timestamp out of range".into()))?;

        if (now - sent_at).abs() > self.window {
            return Err(SecurityError::RequestExpired);
        }

        let forget_at = now + self.window;
        match self.seen.entry(nonce.to_string()) {
            Entry::Occupied(mut e) => {
                if *e.get() > now {
                    return Err(SecurityError::DuplicateRequest);
                }
                // Stale entry the sweeper has not reached yet.
                e.insert(forget_at);
            }
            Entry::Vacant(v) => {
                v.insert(forget_at);
            }
        }
        Ok(())
    }

    /// Header-level entry point. Requests carrying neither header are not
    /// using replay protection and pass through.
    pub fn check_headers(
        &self,
        timestamp: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<(), SecurityError> {
        match (timestamp, nonce) {
            (None, None) => Ok(()),
            (Some(ts), Some(nonce)) => {
                let nonce = nonce.trim();
                if nonce.is_empty() || nonce.len() > MAX_NONCE_LEN {
                    return Err(SecurityError::RequestInvalid("invalid nonce".into()));
                }
                let ts: i64 = ts
                    .trim()
                    .parse()
                    .map_err(|_| SecurityError::RequestInvalid("invalid timestamp".into()))?;
                self.check(ts, nonce)
            }
            _ => Err(SecurityError::RequestInvalid(
                "timestamp and nonce must be sent together".into(),
            )),
        }
    }

    /// Evict nonces whose window has passed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.seen.len();
        self.seen.retain(|_, forget_at| *forget_at > now);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (ReplayGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (ReplayGuard::new(clock.clone()), clock)
    }

    fn now_ms(clock: &ManualClock) -> i64 {
        clock.now().timestamp_millis()
    }

    #[test]
    fn test_fresh_request_accepted() {
        let (guard, clock) = guard();
        assert!(guard.check(now_ms(&clock), "n-1").is_ok());
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let (guard, clock) = guard();
        let ts = now_ms(&clock);
        assert!(guard.check(ts, "n-1").is_ok());
        assert_eq!(guard.check(ts, "n-1"), Err(SecurityError::DuplicateRequest));
    }

    #[test]
    fn test_stale_timestamp_rejected_even_with_fresh_nonce() {
        let (guard, clock) = guard();
        let old = (clock.now() - Duration::minutes(5) - Duration::seconds(1)).timestamp_millis();
        assert_eq!(guard.check(old, "fresh"), Err(SecurityError::RequestExpired));

        let future = (clock.now() + Duration::minutes(6)).timestamp_millis();
        assert_eq!(guard.check(future, "fresh-2"), Err(SecurityError::RequestExpired));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_nonce_forgotten_after_window() {
        let (guard, clock) = guard();
        assert!(guard.check(now_ms(&clock), "n-1").is_ok());

        clock.advance(Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(guard.sweep(), 1);
        assert!(guard.is_empty());
        assert!(guard.check(now_ms(&clock), "n-1").is_ok());
    }

    #[test]
    fn test_headers_absent_bypass() {
        let (guard, _) = guard();
        assert!(guard.check_headers(None, None).is_ok());
        assert!(guard.is_empty());
    }

    #[test]
    fn test_half_headers_rejected() {
        let (guard, clock) = guard();
        let ts = now_ms(&clock).to_string();
        assert!(matches!(
            guard.check_headers(Some(&ts), None),
            Err(SecurityError::RequestInvalid(_))
        ));
        assert!(matches!(
            guard.check_headers(None, Some("n")),
            Err(SecurityError::RequestInvalid(_))
        ));
        assert!(matches!(
            guard.check_headers(Some("yesterday"), Some("n")),
            Err(SecurityError::RequestInvalid(_))
        ));
    }

    #[test]
    fn test_concurrent_same_nonce_only_one_wins() {
        let (guard, clock) = guard();
        let guard = Arc::new(guard);
        let ts = now_ms(&clock);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.check(ts, "shared").is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }
}
