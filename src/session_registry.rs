// src/session_registry.rs
// Session lifecycle, parent linkage, metadata, orphan recovery (spec §4.3).
// Grounded on the teacher's session/manager.rs: one struct over a shared
// pool, sqlx::query_as for simple projections, plain query + Row::get when
// a JSON column needs a decode step.

use crate::error::{MemoryError, Result};
use crate::ids::new_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub one_liner: Option<String>,
    pub paragraph: Option<String>,
    pub detailed: Option<String>,
    pub decisions: Vec<String>,
    pub participants: Vec<String>,
    pub session_type: Option<String>,
    pub tools_used: Vec<String>,
    pub files_touched: Vec<String>,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Option<SessionMetadata>,
    pub summary: Option<String>,
    pub parent_session_id: Option<String>,
    pub parent_tool_call_id: Option<String>,
    /// Derived, never a stored counter (spec §3). Populated by queries that
    /// join against archived messages; zero otherwise.
    pub message_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StartSessionOptions {
    pub started_at: Option<DateTime<Utc>>,
    pub parent_session_id: Option<String>,
    pub parent_tool_call_id: Option<String>,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::fatal(format!("corrupt timestamp {s}: {e}")))
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    let started_at: String = row.try_get("started_at").map_err(MemoryError::from_sqlx)?;
    let ended_at: Option<String> = row.try_get("ended_at").map_err(MemoryError::from_sqlx)?;
    let tags_json: Option<String> = row.try_get("tags_json").map_err(MemoryError::from_sqlx)?;
    let metadata_json: Option<String> = row.try_get("metadata_json").map_err(MemoryError::from_sqlx)?;

    // Corrupt metadata is a Fatal-logged, field-nulled degradation, not a
    // read failure (spec §7): the rest of the session is still usable.
    let metadata = metadata_json.and_then(|raw| match serde_json::from_str(&raw) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::error!(session_id = %row.get::<String, _>("id"), error = %e, "corrupt session metadata");
            None
        }
    });

    Ok(Session {
        id: row.try_get("id").map_err(MemoryError::from_sqlx)?,
        conversation_id: row.try_get("conversation_id").map_err(MemoryError::from_sqlx)?,
        started_at: parse_timestamp(&started_at)?,
        ended_at: ended_at.map(|s| parse_timestamp(&s)).transpose()?,
        end_reason: row.try_get("end_reason").map_err(MemoryError::from_sqlx)?,
        title: row.try_get("title").map_err(MemoryError::from_sqlx)?,
        tags: tags_json
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        metadata,
        summary: row.try_get("summary").map_err(MemoryError::from_sqlx)?,
        parent_session_id: row.try_get("parent_session_id").map_err(MemoryError::from_sqlx)?,
        parent_tool_call_id: row.try_get("parent_tool_call_id").map_err(MemoryError::from_sqlx)?,
        message_count: 0,
    })
}

/// Session lifecycle, parent linkage, metadata, and orphan recovery
/// (spec §4.3).
#[derive(Clone)]
pub struct SessionRegistry {
    pool: SqlitePool,
}

impl SessionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn start_session(
        &self,
        conversation_id: &str,
        options: StartSessionOptions,
    ) -> Result<Session> {
        if let Some(parent) = &options.parent_session_id {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = ?")
                .bind(parent)
                .fetch_optional(&self.pool)
                .await
                .map_err(MemoryError::from_sqlx)?;
            if exists.is_none() {
                return Err(MemoryError::invalid(format!("parent session {parent} does not exist")));
            }
        }

        let id = new_id();
        let started_at = options.started_at.unwrap_or_else(Utc::now);

        sqlx::query(
            "INSERT INTO sessions (id, conversation_id, started_at, parent_session_id, parent_tool_call_id)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(started_at.to_rfc3339())
        .bind(&options.parent_session_id)
        .bind(&options.parent_tool_call_id)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        info!(session_id = %id, conversation_id, "started session");

        Ok(Session {
            id,
            conversation_id: conversation_id.to_string(),
            started_at,
            ended_at: None,
            end_reason: None,
            title: None,
            tags: Vec::new(),
            metadata: None,
            summary: None,
            parent_session_id: options.parent_session_id,
            parent_tool_call_id: options.parent_tool_call_id,
            message_count: 0,
        })
    }

    /// Idempotent by design: re-ending overwrites reason and time (open
    /// question in spec §9, resolved as "overwrite" — see DESIGN.md).
    pub async fn end_session(&self, session_id: &str, reason: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        let ended_at = at.unwrap_or_else(Utc::now);
        let affected = sqlx::query("UPDATE sessions SET ended_at = ?, end_reason = ? WHERE id = ?")
            .bind(ended_at.to_rfc3339())
            .bind(reason)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(MemoryError::from_sqlx)?
            .rows_affected();

        if affected == 0 {
            return Err(MemoryError::not_found(format!("session {session_id}")));
        }
        info!(session_id, reason, "ended session");
        Ok(())
    }

    pub async fn active_session(&self, conversation_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE conversation_id = ? AND ended_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(MemoryError::from_sqlx)?
            .ok_or_else(|| MemoryError::not_found(format!("session {session_id}")))?;

        session_from_row(&row)
    }

    pub async fn list_sessions(&self, conversation_id: Option<&str>, limit: i64) -> Result<Vec<Session>> {
        let rows = match conversation_id {
            Some(c) => sqlx::query(
                "SELECT * FROM sessions WHERE conversation_id = ? ORDER BY started_at DESC LIMIT ?",
            )
            .bind(c)
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query("SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(MemoryError::from_sqlx)?;

        let mut sessions: Vec<Session> = rows.iter().map(session_from_row).collect::<Result<_>>()?;
        self.attach_message_counts(&mut sessions).await?;
        Ok(sessions)
    }

    pub async fn list_child_sessions(&self, parent_session_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE parent_session_id = ? ORDER BY started_at ASC",
        )
        .bind(parent_session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let mut sessions: Vec<Session> = rows.iter().map(session_from_row).collect::<Result<_>>()?;
        self.attach_message_counts(&mut sessions).await?;
        Ok(sessions)
    }

    /// Ended sessions with no title, oldest-first, filtered to those with
    /// at least one archived message. Over-fetches then filters in memory
    /// rather than joining (spec §4.3).
    pub async fn unsummarized_sessions(&self, limit: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE ended_at IS NOT NULL AND title IS NULL
             ORDER BY started_at ASC LIMIT ?",
        )
        .bind(limit * 4)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let mut sessions: Vec<Session> = rows.iter().map(session_from_row).collect::<Result<_>>()?;
        self.attach_message_counts(&mut sessions).await?;

        sessions.retain(|s| s.message_count > 0);
        sessions.truncate(limit as usize);
        Ok(sessions)
    }

    pub async fn set_session_metadata(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
        title: Option<&str>,
        tags: &[String],
    ) -> Result<()> {
        let summary = metadata
            .paragraph
            .clone()
            .or_else(|| metadata.one_liner.clone());
        let metadata_json = serde_json::to_string(&metadata).map_err(MemoryError::from)?;
        let tags_json = serde_json::to_string(tags).map_err(MemoryError::from)?;

        let affected = sqlx::query(
            "UPDATE sessions SET metadata_json = ?, tags_json = ?, title = COALESCE(?, title), summary = ?
             WHERE id = ?",
        )
        .bind(&metadata_json)
        .bind(&tags_json)
        .bind(title)
        .bind(&summary)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?
        .rows_affected();

        if affected == 0 {
            return Err(MemoryError::not_found(format!("session {session_id}")));
        }
        Ok(())
    }

    /// Set status to ENDED with reason="crash_recovery" for any ACTIVE
    /// session started before the cutoff.
    pub async fn close_orphaned(&self, before: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            "UPDATE sessions SET ended_at = ?, end_reason = 'crash_recovery'
             WHERE ended_at IS NULL AND started_at < ?",
        )
        .bind(&now)
        .bind(before.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?
        .rows_affected();

        if affected > 0 {
            info!(affected, "closed orphaned sessions");
        }
        Ok(affected)
    }

    /// Single grouped query avoiding N+1 reads across many sessions
    /// (spec §4.3).
    async fn attach_message_counts(&self, sessions: &mut [Session]) -> Result<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT session_id, COUNT(*) as n FROM messages
             WHERE status = 'archived' AND session_id IN ({placeholders})
             GROUP BY session_id"
        );

        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(MemoryError::from_sqlx)?;

        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in rows {
            let session_id: String = row.try_get("session_id").map_err(MemoryError::from_sqlx)?;
            let n: i64 = row.try_get("n").map_err(MemoryError::from_sqlx)?;
            counts.insert(session_id, n);
        }

        for session in sessions.iter_mut() {
            session.message_count = counts.get(&session.id).copied().unwrap_or(0);
        }
        Ok(())
    }
}
