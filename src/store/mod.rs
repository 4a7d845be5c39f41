// src/store/mod.rs
// Schema, migrations, single-connection access, and identifier generation
// (spec §4.1). Grounded on the teacher's memory/storage/sqlite/store.rs: one
// SqlitePool owned here, borrowed by every other component.

pub mod migrate;

use crate::config::StoreConfig;
use crate::error::{MemoryError, Result};
use crate::ids::is_safe_sql_identifier;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Owns the single logical connection to the persistent store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    fts_enabled: bool,
}

impl Store {
    /// Open the store, running the schema migrator to completion.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| MemoryError::fatal(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms as u64));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await
            .map_err(MemoryError::from_sqlx)?;

        let fts_enabled = migrate::run(&pool).await?;

        info!(fts_enabled, "conversation memory store opened");

        Ok(Self { pool, fts_enabled })
    }

    /// Wrap an already-open pool (used by tests that need to share a pool
    /// across components without reopening the database).
    pub fn from_pool(pool: SqlitePool, fts_enabled: bool) -> Self {
        Self { pool, fts_enabled }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Validate a table/column identifier before interpolating it into SQL.
    /// Used by the migration probes (spec §4.1) which build ALTER TABLE /
    /// PRAGMA statements dynamically.
    pub fn validate_identifier(name: &str) -> Result<()> {
        if is_safe_sql_identifier(name) {
            Ok(())
        } else {
            Err(MemoryError::invalid(format!(
                "unsafe sql identifier: {name}"
            )))
        }
    }

    /// Rebuild the FTS index from the messages table. Used after purges in
    /// fallback (non-unified) mode and is a no-op when triggers keep the
    /// index current (spec §4.7).
    pub async fn rebuild_fts_index(&self) -> Result<()> {
        if !self.fts_enabled {
            return Ok(());
        }
        sqlx::query("INSERT INTO messages_fts(messages_fts) VALUES('rebuild')")
            .execute(&self.pool)
            .await
            .map_err(MemoryError::from_sqlx)?;
        Ok(())
    }
}

/// Probe whether a column exists on a table by attempting a trivial read
/// (spec §4.1 migration policy: "probe existence by attempting a trivial
/// read; if the read fails, emit the additive change").
pub(crate) async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    Store::validate_identifier(table)?;
    Store::validate_identifier(column)?;
    let sql = format!("SELECT {column} FROM {table} LIMIT 0");
    match sqlx::query(&sql).fetch_optional(pool).await {
        Ok(_) => Ok(true),
        Err(sqlx::Error::ColumnNotFound(_)) => Ok(false),
        Err(e) => {
            // SQLite reports a missing column as a generic Database error
            // ("no such column: x"), not ColumnNotFound, so fall back to a
            // message check before propagating.
            let msg = e.to_string().to_lowercase();
            if msg.contains("no such column") {
                Ok(false)
            } else {
                warn!(table, column, error = %e, "column probe failed");
                Err(MemoryError::from_sqlx(e))
            }
        }
    }
}
