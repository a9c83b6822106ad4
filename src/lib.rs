//! Propdesk - Admin authentication and session security
//!
//! The security core of the Propdesk property-management backend: OTP login
//! for whitelisted admin phones, signed bearer tokens bound to a single
//! server-side session, and the request guards in front of every admin route.
//!
//! # Modules
//!
//! - [`admin`] - Admin records, phone normalization, whitelist
//! - [`token`] - Signed bearer tokens (HS256) and realm resolution
//! - [`session`] - Single active session per admin, sliding expiry
//! - [`otp`] - One-time login codes
//! - [`security`] - IP blocks, attempt log, rate limits, replay guard, envelope
//! - [`gateway`] - HTTP router, middleware and handlers
//! - [`sweeper`] - Periodic cleanup of expired state
//! - [`db`] - PostgreSQL pool and realm-keyed data connections

pub mod admin;
pub mod clock;
pub mod config;
pub mod db;
pub mod gateway;
pub mod logging;
pub mod otp;
pub mod realm;
pub mod security;
pub mod session;
pub mod sweeper;
pub mod token;

// Convenient re-exports at crate root
pub use admin::{Admin, AdminRole, CredentialStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use gateway::{AppState, AuthContext, Stores};
pub use realm::Realm;
pub use security::SecurityError;
pub use session::{Session, SessionService};
pub use token::{AuthMode, Claims, TokenService};
