// src/archive_view.rs
// Transcript retrieval, iteration records, cross-session linking, stats
// (spec §4.4 component C4). Reads only through the messages/tool_calls
// tables already populated by the Message Log and Session Registry.

use crate::error::{MemoryError, Result};
use crate::message_log::{Message, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIteration {
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_call_ids: Vec<String>,
    pub tools_offered: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub break_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub session_id: String,
    pub idx: i64,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_call_count: i64,
    pub tool_call_ids: Vec<String>,
    pub tools_offered: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub had_tool_calls: bool,
    pub break_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationStats {
    pub active_count: i64,
    pub compacted_count: i64,
    pub archived_count: i64,
    pub session_count: i64,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::fatal(format!("corrupt timestamp {s}: {e}")))
}

fn iteration_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Iteration> {
    let started_at: String = row.try_get("started_at").map_err(MemoryError::from_sqlx)?;
    let tool_call_ids_json: Option<String> =
        row.try_get("tool_call_ids_json").map_err(MemoryError::from_sqlx)?;
    let tools_offered_json: Option<String> =
        row.try_get("tools_offered_json").map_err(MemoryError::from_sqlx)?;
    let had_tool_calls: i64 = row.try_get("had_tool_calls").map_err(MemoryError::from_sqlx)?;

    Ok(Iteration {
        session_id: row.try_get("session_id").map_err(MemoryError::from_sqlx)?,
        idx: row.try_get("idx").map_err(MemoryError::from_sqlx)?,
        model: row.try_get("model").map_err(MemoryError::from_sqlx)?,
        input_tokens: row.try_get("input_tokens").map_err(MemoryError::from_sqlx)?,
        output_tokens: row.try_get("output_tokens").map_err(MemoryError::from_sqlx)?,
        tool_call_count: row.try_get("tool_call_count").map_err(MemoryError::from_sqlx)?,
        tool_call_ids: tool_call_ids_json
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        tools_offered: tools_offered_json
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        started_at: parse_timestamp(&started_at)?,
        duration_ms: row.try_get("duration_ms").map_err(MemoryError::from_sqlx)?,
        had_tool_calls: had_tool_calls != 0,
        break_reason: row.try_get("break_reason").map_err(MemoryError::from_sqlx)?,
    })
}

/// Transcript retrieval, iteration bookkeeping, and stats over archived
/// data (spec §4.4).
#[derive(Clone)]
pub struct ArchiveView {
    pool: SqlitePool,
}

impl ArchiveView {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_session_transcript(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        rows.iter().map(crate::message_log::message_from_row).collect()
    }

    pub async fn get_session_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCall>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_calls WHERE session_id = ? ORDER BY started_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        rows.iter().map(crate::message_log::tool_call_from_row).collect()
    }

    /// Append a batch of iterations to a session. Incoming local indices
    /// [0..n) are offset past the current maximum stored index for the
    /// session (spec §3 invariant, §8 iteration-offsetting scenario).
    pub async fn append_iterations(&self, session_id: &str, batch: Vec<NewIteration>) -> Result<Vec<Iteration>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let current_max: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT MAX(idx) FROM archive_iterations WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(MemoryError::from_sqlx)?;
        let base = current_max.and_then(|(m,)| m).map(|m| m + 1).unwrap_or(0);

        let mut tx = self.pool.begin().await.map_err(MemoryError::from_sqlx)?;
        let mut stored = Vec::with_capacity(batch.len());

        for (offset, iter) in batch.into_iter().enumerate() {
            let idx = base + offset as i64;
            let tool_call_count = iter.tool_call_ids.len() as i64;
            let had_tool_calls = tool_call_count > 0;
            let tool_call_ids_json =
                serde_json::to_string(&iter.tool_call_ids).map_err(MemoryError::from)?;
            let tools_offered_json =
                serde_json::to_string(&iter.tools_offered).map_err(MemoryError::from)?;

            sqlx::query(
                "INSERT INTO archive_iterations (
                    session_id, idx, model, input_tokens, output_tokens, tool_call_count,
                    tool_call_ids_json, tools_offered_json, started_at, duration_ms,
                    had_tool_calls, break_reason
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(idx)
            .bind(&iter.model)
            .bind(iter.input_tokens)
            .bind(iter.output_tokens)
            .bind(tool_call_count)
            .bind(&tool_call_ids_json)
            .bind(&tools_offered_json)
            .bind(iter.started_at.to_rfc3339())
            .bind(iter.duration_ms)
            .bind(had_tool_calls as i64)
            .bind(&iter.break_reason)
            .execute(&mut *tx)
            .await
            .map_err(MemoryError::from_sqlx)?;

            stored.push(Iteration {
                session_id: session_id.to_string(),
                idx,
                model: iter.model,
                input_tokens: iter.input_tokens,
                output_tokens: iter.output_tokens,
                tool_call_count,
                tool_call_ids: iter.tool_call_ids,
                tools_offered: iter.tools_offered,
                started_at: iter.started_at,
                duration_ms: iter.duration_ms,
                had_tool_calls,
                break_reason: iter.break_reason,
            });
        }

        tx.commit().await.map_err(MemoryError::from_sqlx)?;
        Ok(stored)
    }

    pub async fn list_iterations(&self, session_id: &str) -> Result<Vec<Iteration>> {
        let rows = sqlx::query(
            "SELECT * FROM archive_iterations WHERE session_id = ? ORDER BY idx ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        rows.iter().map(iteration_from_row).collect()
    }

    /// Link pending iteration records whose `tool_call_ids` refer to
    /// now-archived calls by stamping the iteration index onto those
    /// tool-call rows (spec §4.6 step 5).
    pub async fn link_iteration_tool_calls(&self, session_id: &str) -> Result<u64> {
        let iterations = self.list_iterations(session_id).await?;
        let mut linked = 0u64;

        for iteration in iterations {
            for call_id in &iteration.tool_call_ids {
                let affected = sqlx::query(
                    "UPDATE tool_calls SET iteration_index = ?
                     WHERE id = ? AND session_id = ? AND iteration_index IS NULL",
                )
                .bind(iteration.idx)
                .bind(call_id)
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(MemoryError::from_sqlx)?
                .rows_affected();
                linked += affected;
            }
        }

        Ok(linked)
    }

    pub async fn conversation_stats(&self, conversation_id: &str) -> Result<ConversationStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as n FROM messages WHERE conversation_id = ? GROUP BY status",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let mut stats = ConversationStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(MemoryError::from_sqlx)?;
            let n: i64 = row.try_get("n").map_err(MemoryError::from_sqlx)?;
            match status.as_str() {
                "active" => stats.active_count = n,
                "compacted" => stats.compacted_count = n,
                "archived" => stats.archived_count = n,
                _ => {}
            }
        }

        let (session_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await
                .map_err(MemoryError::from_sqlx)?;
        stats.session_count = session_count;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::{MessageLog, Role};
    use crate::session_registry::{SessionRegistry, StartSessionOptions};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::store::migrate::run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn transcript_reflects_archived_messages() {
        let pool = pool().await;
        let log = MessageLog::new(pool.clone());
        let registry = SessionRegistry::new(pool.clone());
        let view = ArchiveView::new(pool.clone());

        log.append_message("c1", Role::User, "hello").await.unwrap();
        log.append_message("c1", Role::Assistant, "hi there!").await.unwrap();
        let session = registry.start_session("c1", StartSessionOptions::default()).await.unwrap();
        log.archive_messages("c1", &session.id, "reset").await.unwrap();

        let transcript = view.get_session_transcript(&session.id).await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
    }

    #[tokio::test]
    async fn iterations_offset_across_batches() {
        let pool = pool().await;
        let registry = SessionRegistry::new(pool.clone());
        let view = ArchiveView::new(pool.clone());
        let session = registry.start_session("c1", StartSessionOptions::default()).await.unwrap();

        let batch1 = vec![
            NewIteration {
                model: Some("model-a".to_string()),
                input_tokens: 10,
                output_tokens: 5,
                tool_call_ids: vec![],
                tools_offered: vec![],
                started_at: Utc::now(),
                duration_ms: 100,
                break_reason: None,
            },
            NewIteration {
                model: Some("model-a".to_string()),
                input_tokens: 10,
                output_tokens: 5,
                tool_call_ids: vec![],
                tools_offered: vec![],
                started_at: Utc::now(),
                duration_ms: 100,
                break_reason: None,
            },
        ];
        let stored1 = view.append_iterations(&session.id, batch1).await.unwrap();
        assert_eq!(stored1.iter().map(|i| i.idx).collect::<Vec<_>>(), vec![0, 1]);

        let batch2 = vec![
            NewIteration {
                model: Some("model-b".to_string()),
                input_tokens: 20,
                output_tokens: 8,
                tool_call_ids: vec![],
                tools_offered: vec![],
                started_at: Utc::now(),
                duration_ms: 100,
                break_reason: None,
            },
            NewIteration {
                model: Some("model-b".to_string()),
                input_tokens: 20,
                output_tokens: 8,
                tool_call_ids: vec![],
                tools_offered: vec![],
                started_at: Utc::now(),
                duration_ms: 100,
                break_reason: None,
            },
        ];
        let stored2 = view.append_iterations(&session.id, batch2).await.unwrap();
        assert_eq!(stored2.iter().map(|i| i.idx).collect::<Vec<_>>(), vec![2, 3]);
        assert_ne!(stored1[0].model, stored2[0].model);
    }
}
