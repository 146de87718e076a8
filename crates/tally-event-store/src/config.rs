//! Store configuration read from the environment, and backend selection.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tally_core::error::StoreError;
use tally_core::repository::EventRepository;
use thiserror::Error;

use crate::pg_event_repository::PgEventRepository;
use crate::sql::storage;
use crate::sqlite_event_repository::SqliteEventRepository;

/// Database used when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";

/// Pool size used when `TALLY_MAX_CONNECTIONS` is unset.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Invalid store configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The database URL names no supported backend.
    #[error("unsupported database URL: {0} (expected sqlite: or postgres://)")]
    UnsupportedUrl(String),

    /// An environment variable holds an unusable value.
    #[error("{name} is invalid: {message}")]
    Invalid {
        /// The variable name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Storage backend, chosen by URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `sqlite:` URLs, file-backed or in-memory.
    Sqlite,
    /// `postgres://` or `postgresql://` URLs.
    Postgres,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else {
            Err(ConfigError::UnsupportedUrl(url.to_string()))
        }
    }
}

/// Connection settings for [`connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    database_url: String,
    backend: Backend,
    max_connections: u32,
}

impl StoreConfig {
    /// Builds a configuration for `database_url` with the default pool size.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedUrl` for an unknown URL scheme.
    pub fn new(database_url: impl Into<String>) -> Result<Self, ConfigError> {
        let database_url = database_url.into();
        let backend = database_url.parse()?;
        Ok(Self {
            database_url,
            backend,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// Reads `DATABASE_URL` and `TALLY_MAX_CONNECTIONS` from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if either variable is unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`StoreConfig::from_env`] but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if either variable is unusable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let config = Self::new(database_url)?;
        match lookup("TALLY_MAX_CONNECTIONS") {
            Some(raw) => {
                let max_connections = raw.parse().map_err(|e| ConfigError::Invalid {
                    name: "TALLY_MAX_CONNECTIONS",
                    message: format!("{e}"),
                })?;
                config.with_max_connections(max_connections)
            }
            None => Ok(config),
        }
    }

    /// Sets the pool size.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for zero.
    pub fn with_max_connections(mut self, max_connections: u32) -> Result<Self, ConfigError> {
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "TALLY_MAX_CONNECTIONS",
                message: "must be at least 1".into(),
            });
        }
        self.max_connections = max_connections;
        Ok(self)
    }

    /// The database URL.
    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// The backend named by the URL.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Returns `true` for an in-memory SQLite database.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.backend == Backend::Sqlite
            && (self.database_url.contains(":memory:") || self.database_url.contains("mode=memory"))
    }

    /// The pool size actually used: always 1 for in-memory SQLite, where
    /// every connection would otherwise open a separate database.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        if self.is_in_memory() {
            1
        } else {
            self.max_connections
        }
    }
}

/// Opens a pool for `config`, creates the schema, and returns the
/// repository. A file-backed SQLite database is created if missing.
///
/// # Errors
///
/// Returns `StoreError::Storage` if the database cannot be opened or the
/// schema cannot be created.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn EventRepository>, StoreError> {
    tracing::info!(
        backend = ?config.backend(),
        max_connections = config.max_connections(),
        "connecting event store"
    );
    match config.backend() {
        Backend::Sqlite => {
            let options = SqliteConnectOptions::from_str(config.database_url())
                .map_err(storage)?
                .create_if_missing(true);
            let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections());
            if config.is_in_memory() {
                pool_options = pool_options.idle_timeout(None).max_lifetime(None);
            }
            let pool = pool_options.connect_with(options).await.map_err(storage)?;
            let repository = SqliteEventRepository::new(pool);
            repository.ensure_tables().await?;
            Ok(Arc::new(repository))
        }
        Backend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections())
                .connect(config.database_url())
                .await
                .map_err(storage)?;
            let repository = PgEventRepository::new(pool);
            repository.ensure_tables().await?;
            Ok(Arc::new(repository))
        }
    }
}
