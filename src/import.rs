// src/import.rs
// Idempotent external-source import and source-scoped purge (spec §4.7,
// C8).

use crate::error::{MemoryError, Result};
use crate::session_registry::{SessionRegistry, StartSessionOptions};
use crate::store::Store;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

#[derive(Clone)]
pub struct ImportService {
    pool: SqlitePool,
    store: Store,
    sessions: SessionRegistry,
}

impl ImportService {
    pub fn new(store: Store, sessions: SessionRegistry) -> Self {
        Self {
            pool: store.pool().clone(),
            store,
            sessions,
        }
    }

    pub async fn record_import(&self, source_id: &str, source_type: &str, archive_session_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_metadata (source_id, source_type, archive_session_id, imported_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(source_id, source_type) DO NOTHING",
        )
        .bind(source_id)
        .bind(source_type)
        .bind(archive_session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        Ok(())
    }

    pub async fn is_imported(&self, source_id: &str, source_type: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM import_metadata WHERE source_id = ? AND source_type = ?",
        )
        .bind(source_id)
        .bind(source_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        Ok(row.is_some())
    }

    /// Preserves an externally supplied start time so chronological search
    /// continues to work across imported history (spec §4.7).
    pub async fn start_session_at(
        &self,
        conversation_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<crate::session_registry::Session> {
        self.sessions
            .start_session(
                conversation_id,
                StartSessionOptions {
                    started_at: Some(started_at),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn end_session_at(
        &self,
        session_id: &str,
        reason: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        self.sessions.end_session(session_id, reason, Some(ended_at)).await
    }

    /// Removes every archive session recorded under `source_type` together
    /// with its messages, tool calls, and import record. Returns the
    /// number of sessions purged.
    pub async fn purge_imported(&self, source_type: &str) -> Result<u64> {
        let sessions: Vec<String> = sqlx::query(
            "SELECT DISTINCT archive_session_id FROM import_metadata WHERE source_type = ?",
        )
        .bind(source_type)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?
        .into_iter()
        .map(|row| row.try_get::<String, _>("archive_session_id"))
        .collect::<std::result::Result<_, _>>()
        .map_err(MemoryError::from_sqlx)?;

        if sessions.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(MemoryError::from_sqlx)?;

        for session_id in &sessions {
            sqlx::query("DELETE FROM messages WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(MemoryError::from_sqlx)?;
            sqlx::query("DELETE FROM tool_calls WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(MemoryError::from_sqlx)?;
            sqlx::query("DELETE FROM archive_iterations WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(MemoryError::from_sqlx)?;
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(MemoryError::from_sqlx)?;
        }

        sqlx::query("DELETE FROM import_metadata WHERE source_type = ?")
            .bind(source_type)
            .execute(&mut *tx)
            .await
            .map_err(MemoryError::from_sqlx)?;

        tx.commit().await.map_err(MemoryError::from_sqlx)?;

        // Triggers keep the index current in unified mode; fallback mode
        // needs an explicit rebuild after a bulk delete (spec §4.7).
        self.store.rebuild_fts_index().await?;

        info!(source_type, purged = sessions.len(), "purged imported sessions");
        Ok(sessions.len() as u64)
    }
}
