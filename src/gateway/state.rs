use chrono::Duration;
use std::sync::Arc;

use crate::admin::{AdminStore, CredentialStore, MemoryAdminStore, PgAdminStore};
use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::db::{DataConnections, Database};
use crate::otp::{OtpIssuer, OtpSender};
use crate::security::attempt_log::{MemoryAttemptStore, PgAttemptStore};
use crate::security::ip_block::{MemoryIpBlockStore, PgIpBlockStore};
use crate::security::{
    AttemptLog, AttemptStore, BasicEnricher, ClientEnricher, EnvelopeCipher, IpBlockStore,
    IpReputation, RateLimiter, ReplayGuard, SuspiciousActivityEscalator, TrustedProxies,
};
use crate::session::{MemorySessionStore, PgSessionStore, SessionService, SessionStore};
use crate::token::{TokenService, TokenSettings};

/// Persistence backends for the security core.
#[derive(Clone)]
pub struct Stores {
    pub admins: Arc<dyn AdminStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub blocks: Arc<dyn IpBlockStore>,
    pub attempts: Arc<dyn AttemptStore>,
}

impl Stores {
    /// Process-local stores. State is lost on restart.
    pub fn memory() -> Self {
        Self {
            admins: Arc::new(MemoryAdminStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            blocks: Arc::new(MemoryIpBlockStore::new()),
            attempts: Arc::new(MemoryAttemptStore::new()),
        }
    }

    pub fn postgres(db: Arc<Database>) -> Self {
        Self {
            admins: Arc::new(PgAdminStore::new(db.clone())),
            sessions: Arc::new(PgSessionStore::new(db.clone())),
            blocks: Arc::new(PgIpBlockStore::new(db.clone())),
            attempts: Arc::new(PgAttemptStore::new(db)),
        }
    }
}

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<CredentialStore>,
    pub sessions: Arc<SessionService>,
    pub tokens: Arc<TokenService>,
    pub ledger: Arc<IpReputation>,
    pub attempts: Arc<AttemptLog>,
    pub limiter: Arc<RateLimiter>,
    pub escalator: Arc<SuspiciousActivityEscalator>,
    pub replay: Arc<ReplayGuard>,
    pub envelope: Arc<EnvelopeCipher>,
    pub otp: Arc<OtpIssuer>,
    pub enricher: Arc<dyn ClientEnricher>,
    /// Peers allowed to set `X-Forwarded-For`.
    pub trusted_proxies: TrustedProxies,
    /// Realm-keyed handles for domain routes.
    pub data: DataConnections,
    /// Auth database used by the health check; `None` on memory stores.
    pub auth_db: Option<Arc<Database>>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        config: &SecurityConfig,
        stores: Stores,
        data: DataConnections,
        otp_sender: Arc<dyn OtpSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let attempts = Arc::new(AttemptLog::new(stores.attempts, clock.clone()));
        let ledger = Arc::new(IpReputation::new(
            stores.blocks,
            clock.clone(),
            config.production,
        ));
        let limiter = Arc::new(RateLimiter::new(
            ledger.clone(),
            attempts.clone(),
            clock.clone(),
        ));
        let escalator = Arc::new(SuspiciousActivityEscalator::new(
            attempts.clone(),
            ledger.clone(),
        ));
        let credentials = Arc::new(CredentialStore::new(
            stores.admins,
            &config.admin_whitelist,
            &config.default_country_code,
            clock.clone(),
        ));
        let sessions = Arc::new(SessionService::new(
            stores.sessions,
            clock.clone(),
            Duration::seconds(config.session_ttl_secs),
        ));
        let tokens = Arc::new(TokenService::new(
            TokenSettings::from_config(config),
            clock.clone(),
        ));

        Self {
            credentials,
            sessions,
            tokens,
            ledger,
            attempts,
            limiter,
            escalator,
            replay: Arc::new(ReplayGuard::new(clock.clone())),
            envelope: Arc::new(EnvelopeCipher::new(&config.communication_secret)),
            otp: Arc::new(OtpIssuer::new(otp_sender, clock.clone())),
            enricher: Arc::new(BasicEnricher),
            trusted_proxies: TrustedProxies::default(),
            data,
            auth_db: None,
            clock,
        }
    }

    pub fn with_auth_db(mut self, db: Arc<Database>) -> Self {
        self.auth_db = Some(db);
        self
    }

    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn ClientEnricher>) -> Self {
        self.enricher = enricher;
        self
    }
}
