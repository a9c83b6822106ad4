use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::security::TrustedProxies;
use crate::token::AuthMode;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Reverse proxy addresses whose `X-Forwarded-For` is honoured.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl GatewayConfig {
    pub fn proxies(&self) -> Result<TrustedProxies> {
        TrustedProxies::parse(&self.trusted_proxies)
            .context("gateway.trusted_proxies must be plain IP addresses")
    }
}

/// PostgreSQL connection settings. Without `url` the service runs on
/// in-memory stores.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// Development realm database; falls back to `url`.
    #[serde(default)]
    pub dev_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub connect_retries: u32,
    pub retry_backoff_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            dev_url: None,
            max_connections: 10,
            acquire_timeout_secs: 45,
            connect_retries: 5,
            retry_backoff_secs: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Disables the localhost bypass and hides OTP codes from logs.
    pub production: bool,
    #[serde(default = "default_auth_mode")]
    pub auth_mode: AuthMode,
    pub jwt_secret: String,
    /// Accepted only in lenient mode and only for development-realm tokens.
    #[serde(default)]
    pub dev_jwt_secret: Option<String>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub token_ttl_secs: i64,
    pub session_ttl_secs: i64,
    pub communication_secret: String,
    #[serde(default)]
    pub dev_phone: Option<String>,
    pub default_country_code: String,
    #[serde(default)]
    pub admin_whitelist: Vec<String>,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Strict
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            production: false,
            auth_mode: AuthMode::Strict,
            jwt_secret: String::new(),
            dev_jwt_secret: None,
            jwt_issuer: "propdesk".to_string(),
            jwt_audience: "propdesk-admin".to_string(),
            token_ttl_secs: 24 * 60 * 60,
            session_ttl_secs: 30 * 60,
            communication_secret: String::new(),
            dev_phone: None,
            default_country_code: "91".to_string(),
            admin_whitelist: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: AppConfig =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Secrets and connection strings may come from the environment instead
    /// of the checked-in yaml.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROPDESK_JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("PROPDESK_DEV_JWT_SECRET") {
            self.security.dev_jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("PROPDESK_COMM_SECRET") {
            self.security.communication_secret = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = std::env::var("DEV_DATABASE_URL") {
            self.database.dev_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.security.jwt_secret.len() < 32 {
            anyhow::bail!("security.jwt_secret must be at least 32 characters");
        }
        if self.security.communication_secret.is_empty() {
            anyhow::bail!("security.communication_secret must be set");
        }
        if self.security.session_ttl_secs <= 0 || self.security.token_ttl_secs <= 0 {
            anyhow::bail!("token and session lifetimes must be positive");
        }
        self.gateway.proxies()?;
        Ok(())
    }
}
