//! Propdesk admin auth gateway
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Client  │───▶│  Guards  │───▶│   Auth   │───▶│ Handlers │
//! │  (HTTP)  │    │(IP/Rate) │    │(JWT+Sess)│    │          │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `propdesk [--env dev|prod] [--port N]`

use std::sync::Arc;

use propdesk::clock::{Clock, SystemClock};
use propdesk::config::AppConfig;
use propdesk::db::{DataConnections, Database};
use propdesk::gateway::{self, AppState, Stores};
use propdesk::otp::LogOtpSender;
use propdesk::sweeper::Sweeper;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() {
    let env = get_env();
    let app_config = match AppConfig::load(&env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config '{}': {:#}", env, e);
            std::process::exit(1);
        }
    };
    let _log_guard = propdesk::logging::init_logging(&app_config);

    tracing::info!("Starting Propdesk gateway in {} mode", env);

    let security = &app_config.security;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let otp_sender = Arc::new(LogOtpSender::new(security.production));

    let state = match &app_config.database.url {
        Some(url) => {
            let db = match Database::connect_with_retry(url, &app_config.database).await {
                Ok(db) => Arc::new(db),
                Err(e) => {
                    tracing::error!("Failed to connect to PostgreSQL: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = db.migrate().await {
                tracing::error!("Failed to apply migrations: {}", e);
                std::process::exit(1);
            }

            let dev_db = match &app_config.database.dev_url {
                Some(dev_url) if dev_url != url => {
                    match Database::connect_with_retry(dev_url, &app_config.database).await {
                        Ok(dev) => Arc::new(dev),
                        Err(e) => {
                            tracing::error!("Failed to connect to development database: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
                _ => db.clone(),
            };

            AppState::new(
                security,
                Stores::postgres(db.clone()),
                DataConnections::new(Some(db.clone()), Some(dev_db)),
                otp_sender,
                clock,
            )
            .with_auth_db(db)
        }
        None => {
            tracing::warn!("No database configured, using in-memory stores");
            AppState::new(
                security,
                Stores::memory(),
                DataConnections::default(),
                otp_sender,
                clock,
            )
        }
    };
    let proxies = match app_config.gateway.proxies() {
        Ok(proxies) => proxies,
        Err(e) => {
            tracing::error!("Invalid gateway config: {:#}", e);
            std::process::exit(1);
        }
    };
    if proxies.is_empty() {
        tracing::info!("No trusted proxies, client IP is the socket peer");
    }
    let state = Arc::new(state.with_trusted_proxies(proxies));

    tokio::spawn(Sweeper::new(state.clone()).run());

    let port = get_port_override().unwrap_or(app_config.gateway.port);
    if let Err(e) = gateway::run_server(&app_config.gateway.host, port, state).await {
        tracing::error!("Gateway stopped: {:#}", e);
        std::process::exit(1);
    }
}
