//! SQLite-backed strategy store. The single source of truth every component
//! reads and writes through; all mutating operations run in one transaction
//! and `transition` is the only path that changes `status`.

mod events;
mod orders;
mod runtime;
mod strategies;

pub use events::*;
pub use orders::*;
pub use runtime::*;
pub use strategies::*;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

/// SQLite storage adapter for the engine
#[derive(Clone)]
pub struct SentraStore {
    pool: SqlitePool,
    max_conditions_per_strategy: usize,
}

impl SentraStore {
    /// Open (creating if missing) the engine database.
    pub async fn connect(db_path: &str, max_conditions_per_strategy: usize) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(db_path, "connected to engine store");
        Ok(Self {
            pool,
            max_conditions_per_strategy,
        })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("engine store migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_conditions_per_strategy(&self) -> usize {
        self.max_conditions_per_strategy
    }
}
