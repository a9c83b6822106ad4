//! Request-level defences in front of the authenticator.
//!
//! ## Components
//! - `error`: wire error taxonomy
//! - `enrich`: client IP, device and location snapshots
//! - `ip_block`: IP reputation ledger
//! - `attempt_log`: append-only authentication audit log
//! - `rate_limit`: per-IP sliding windows with punitive escalation
//! - `escalator`: failure-count escalation
//! - `replay`: timestamp + nonce replay guard
//! - `envelope`: encrypted request/response bodies

pub mod attempt_log;
pub mod enrich;
pub mod envelope;
pub mod error;
pub mod escalator;
pub mod ip_block;
pub mod rate_limit;
pub mod replay;

pub use attempt_log::{AttemptLog, AttemptStage, AttemptStore, LoginAttempt, NewAttempt};
pub use enrich::{BasicEnricher, ClientEnricher, ClientInfo, Device, Location, TrustedProxies};
pub use envelope::{EnvelopeCipher, EnvelopeError};
pub use error::{SecurityError, SessionRejection};
pub use escalator::SuspiciousActivityEscalator;
pub use ip_block::{BlockMetadata, BlockReason, BlockedIp, IpBlockStore, IpReputation};
pub use rate_limit::{LimiterKind, RateDecision, RateLimiter};
pub use replay::ReplayGuard;
