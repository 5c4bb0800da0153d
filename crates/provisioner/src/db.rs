use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};

use crate::config::ProvisionerConfig;

mod clusters;
mod instances;
mod pull_dog;
mod types;
mod users;

pub use types::*;

#[cfg(test)]
mod tests;

/// Id of the shared demo cluster. Created lazily, never duplicated.
pub const DEMO_CLUSTER_ID: &str = "6f1d3a52-9d1c-4c44-8f6e-000000000de0";

/// A single connection serializes top-level dispatches; waiting callers queue for up to
/// `acquire_timeout`, which defaults to the length of a full provisioning run.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from_config(&ProvisionerConfig::default())
    }
}

impl PoolLimits {
    #[must_use]
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        Self {
            max_connections: config.database_max_connections(),
            acquire_timeout: config.database_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbClient {
    pool: Pool<Sqlite>,
}

impl DbClient {
    /// Opens the pool without touching the schema.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn connect(database_url: &str, limits: PoolLimits) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(database_url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(limits.max_connections)
            .acquire_timeout(limits.acquire_timeout)
            .connect_with(connect_options)
            .await?;

        Ok(Self { pool })
    }

    /// Creates the database directory, connects with default limits and migrates.
    ///
    /// # Errors
    /// Returns an error if the directory, connection or migrations fail.
    pub async fn initialize(database_path: &str) -> Result<Self> {
        Self::initialize_with_limits(database_path, PoolLimits::default()).await
    }

    /// Same as [`DbClient::initialize`] with explicit pool limits.
    ///
    /// # Errors
    /// Returns an error if the directory, connection or migrations fail.
    pub async fn initialize_with_limits(database_path: &str, limits: PoolLimits) -> Result<Self> {
        if let Some(parent_dir) = Path::new(database_path).parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let db = Self::connect(database_path, limits).await?;
        db.run_migrations().await?;
        db.ensure_wal_mode().await?;

        Ok(db)
    }

    /// # Errors
    /// Returns an error if a migration fails to apply.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the journal mode cannot be switched to WAL.
    pub async fn ensure_wal_mode(&self) -> Result<()> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode=WAL;")
            .fetch_one(&self.pool)
            .await?;

        if journal_mode.to_uppercase() != "WAL" {
            bail!("SQLite WAL mode is not enabled");
        }

        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }
}

/// Repository view over a connection that is already inside a transaction.
#[derive(Debug)]
pub struct Store<'c> {
    connection: &'c mut SqliteConnection,
}

impl<'c> Store<'c> {
    #[must_use]
    pub fn new(connection: &'c mut SqliteConnection) -> Self {
        Self { connection }
    }
}

/// True when the error is a UNIQUE or PRIMARY KEY constraint failure.
#[must_use]
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_unique_violation())
}
