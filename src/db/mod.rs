//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::realm::Realm;

/// Errors raised by the security stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Maps a unique-constraint violation to `Duplicate`.
    pub fn from_insert(err: sqlx::Error, what: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(what.to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Connect, retrying a fixed number of times with a fixed backoff.
    ///
    /// Bootstrap failure is fatal: the caller is expected to exit.
    pub async fn connect_with_retry(
        database_url: &str,
        config: &DatabaseConfig,
    ) -> Result<Self, sqlx::Error> {
        let attempts = config.connect_retries.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(database_url, config).await {
                Ok(db) => return Ok(db),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "PostgreSQL connect attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_secs(config.retry_backoff_secs)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("PostgreSQL unreachable after {} attempts: {}", attempts, e);
                    return Err(e);
                }
            }
        }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Extension trait for safe row access with logging
pub trait SafeRow {
    /// Try to get a value from a column, log error and return None if it fails
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;

    /// Like `try_get_log` but a missing column is a corrupt row.
    fn require<'r, T>(&'r self, column: &str) -> Result<T, StoreError>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        self.try_get_log(column)
            .ok_or_else(|| StoreError::Corrupt(format!("column '{}' unreadable", column)))
    }

    /// Nullable column. NULL and unreadable both come back as `None`.
    fn optional<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        self.try_get_log::<Option<T>>(column).flatten()
    }
}

impl SafeRow for sqlx::postgres::PgRow {
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        use sqlx::Row;
        match self.try_get(column) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("Failed to read column '{}': {}", column, e);
                None
            }
        }
    }
}

/// Realm-keyed database handles for the domain routes.
///
/// Both handles are `None` when the service runs without PostgreSQL.
#[derive(Clone, Default)]
pub struct DataConnections {
    production: Option<Arc<Database>>,
    development: Option<Arc<Database>>,
}

impl DataConnections {
    pub fn new(production: Option<Arc<Database>>, development: Option<Arc<Database>>) -> Self {
        Self {
            production,
            development,
        }
    }

    pub fn resolve(&self, realm: Realm) -> Option<Arc<Database>> {
        match realm {
            Realm::Production => self.production.clone(),
            Realm::Development => self.development.clone(),
        }
    }

    pub fn context(&self, realm: Realm) -> DataContext {
        DataContext {
            realm,
            database: self.resolve(realm),
        }
    }
}

/// Backing store selected for one authenticated request.
#[derive(Clone)]
pub struct DataContext {
    pub realm: Realm,
    pub database: Option<Arc<Database>>,
}
