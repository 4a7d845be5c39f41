// src/message_log.rs
// Append-only message and tool-call records (spec §4.2). Grounded on the
// teacher's memory/storage/sqlite/core.rs row-mapping idiom: plain
// sqlx::query + Row::get rather than query_as, since several reads project
// a JSON column through an extra decode step.

use crate::error::{MemoryError, Result};
use crate::ids::new_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

/// A message's position in the active -> compacted -> archived lifecycle.
/// The ordering of the variants matches the allowed transition order; the
/// status column itself is a checked text column (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Active,
    Compacted,
    Archived,
}

impl MessageStatus {
    fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Active => "active",
            MessageStatus::Compacted => "compacted",
            MessageStatus::Archived => "archived",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "compacted" => MessageStatus::Compacted,
            "archived" => MessageStatus::Archived,
            _ => MessageStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::System,
        }
    }
}

/// The marker used for synthetic compaction-summary messages so they are
/// excluded from `MessagesForCompaction` (spec §4.5 step 6).
const COMPACTION_SUMMARY_REASON: &str = "compaction_summary";

/// One entry of a message's serialized tool-call request list
/// (`messages.tool_calls_json`, spec §3 "optional serialized tool-call
/// request"). Distinct from `tool_calls.args`: this is the request as the
/// issuing message recorded it, not the tool-call row itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCallRequest {
    call_id: String,
    tool_name: String,
    args: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub session_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub token_count: i64,
    pub tool_calls_json: Option<String>,
    pub tool_call_id: Option<String>,
    pub status: MessageStatus,
    pub archived_at: Option<DateTime<Utc>>,
    pub archive_reason: Option<String>,
    pub iteration_index: Option<i64>,
}

pub(crate) fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let created_at: String = row.try_get("created_at").map_err(MemoryError::from_sqlx)?;
    let archived_at: Option<String> = row.try_get("archived_at").map_err(MemoryError::from_sqlx)?;
    Ok(Message {
        id: row.try_get("id").map_err(MemoryError::from_sqlx)?,
        conversation_id: row.try_get("conversation_id").map_err(MemoryError::from_sqlx)?,
        session_id: row.try_get("session_id").map_err(MemoryError::from_sqlx)?,
        role: Role::parse(&row.try_get::<String, _>("role").map_err(MemoryError::from_sqlx)?),
        content: row.try_get("content").map_err(MemoryError::from_sqlx)?,
        created_at: parse_timestamp(&created_at)?,
        token_count: row.try_get("token_count").map_err(MemoryError::from_sqlx)?,
        tool_calls_json: row.try_get("tool_calls_json").map_err(MemoryError::from_sqlx)?,
        tool_call_id: row.try_get("tool_call_id").map_err(MemoryError::from_sqlx)?,
        status: MessageStatus::parse(&row.try_get::<String, _>("status").map_err(MemoryError::from_sqlx)?),
        archived_at: archived_at.map(|s| parse_timestamp(&s)).transpose()?,
        archive_reason: row.try_get("archive_reason").map_err(MemoryError::from_sqlx)?,
        iteration_index: row.try_get("iteration_index").map_err(MemoryError::from_sqlx)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::fatal(format!("corrupt timestamp {s}: {e}")))
}

fn estimate_tokens(content: &str) -> i64 {
    (content.len() as i64 / 4).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub conversation_id: String,
    pub session_id: Option<String>,
    pub tool_name: String,
    pub args: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub iteration_index: Option<i64>,
}

impl ToolCall {
    /// Duration derived from start/complete, per spec §3 "duration is
    /// derivable from start/complete".
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

pub(crate) fn tool_call_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ToolCall> {
    let started_at: String = row.try_get("started_at").map_err(MemoryError::from_sqlx)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(MemoryError::from_sqlx)?;
    Ok(ToolCall {
        id: row.try_get("id").map_err(MemoryError::from_sqlx)?,
        conversation_id: row.try_get("conversation_id").map_err(MemoryError::from_sqlx)?,
        session_id: row.try_get("session_id").map_err(MemoryError::from_sqlx)?,
        tool_name: row.try_get("tool_name").map_err(MemoryError::from_sqlx)?,
        args: row.try_get("args").map_err(MemoryError::from_sqlx)?,
        result: row.try_get("result").map_err(MemoryError::from_sqlx)?,
        error: row.try_get("error").map_err(MemoryError::from_sqlx)?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.map(|s| parse_timestamp(&s)).transpose()?,
        status: row.try_get("status").map_err(MemoryError::from_sqlx)?,
        iteration_index: row.try_get("iteration_index").map_err(MemoryError::from_sqlx)?,
    })
}

/// Append-only record of messages and tool calls for every conversation
/// (spec §4.2). Holds the same pool as the Store but never touches schema.
#[derive(Clone)]
pub struct MessageLog {
    pool: SqlitePool,
}

impl MessageLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the conversation row on demand, then append a message.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let now = Utc::now();
        let now_s = now.to_rfc3339();

        sqlx::query(
            "INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(conversation_id)
        .bind(&now_s)
        .bind(&now_s)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let id = new_id();
        let token_count = estimate_tokens(content);

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at, token_count, status)
             VALUES (?, ?, ?, ?, ?, ?, 'active')",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(&now_s)
        .bind(token_count)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        debug!(conversation_id, message_id = %id, token_count, "appended message");

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            session_id: None,
            role,
            content: content.to_string(),
            created_at: now,
            token_count,
            tool_calls_json: None,
            tool_call_id: None,
            status: MessageStatus::Active,
            archived_at: None,
            archive_reason: None,
            iteration_index: None,
        })
    }

    pub async fn active_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? AND status = 'active'
             ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn all_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn token_count(&self, conversation_id: &str) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(token_count) FROM messages WHERE conversation_id = ? AND status = 'active'",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        Ok(row.0.unwrap_or(0))
    }

    /// All non-system, non-compacted messages except the most recent `keep`
    /// (spec §4.2). Returns empty when at most `keep` such messages exist.
    pub async fn messages_for_compaction(
        &self,
        conversation_id: &str,
        keep: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE conversation_id = ? AND role != 'system' AND status != 'compacted'
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let total = rows.len();
        let keep = keep.max(0) as usize;
        if total <= keep {
            return Ok(Vec::new());
        }

        rows[..total - keep].iter().map(message_from_row).collect()
    }

    /// Set status=compacted for non-system messages strictly older than
    /// `before`. Idempotent: rows already compacted or archived are
    /// unaffected by the WHERE clause's status check. Also sets the legacy
    /// `compacted` boolean column alongside `status`, for readers still on
    /// the older boolean-only column (spec §6 persisted layout).
    pub async fn mark_compacted(&self, conversation_id: &str, before: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET status = 'compacted', compacted = 1
             WHERE conversation_id = ? AND role != 'system' AND status = 'active' AND created_at < ?",
        )
        .bind(conversation_id)
        .bind(before.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        Ok(())
    }

    /// Archive every not-yet-archived message in the conversation, tagging
    /// it with the owning session and a reason. Idempotent: the WHERE
    /// clause excludes already-archived rows.
    pub async fn archive_messages(
        &self,
        conversation_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE messages SET status = 'archived', session_id = ?, archived_at = ?, archive_reason = ?
             WHERE conversation_id = ? AND status != 'archived'",
        )
        .bind(session_id)
        .bind(&now)
        .bind(reason)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let affected = result.rows_affected();
        info!(conversation_id, session_id, affected, "archived messages");
        Ok(affected)
    }

    /// Insert a synthetic system message carrying a compaction summary,
    /// tagged so the next `MessagesForCompaction` call skips it (its role
    /// is `system`, which is already excluded).
    pub async fn add_compaction_summary(&self, conversation_id: &str, text: &str) -> Result<()> {
        let id = new_id();
        let now = Utc::now().to_rfc3339();
        let token_count = estimate_tokens(text);

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at, token_count, status, archive_reason)
             VALUES (?, ?, 'system', ?, ?, ?, 'active', ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(text)
        .bind(&now)
        .bind(token_count)
        .bind(COMPACTION_SUMMARY_REASON)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        info!(conversation_id, message_id = %id, "added compaction summary");
        Ok(())
    }

    /// Create the tool-call row and link it back to the issuing message
    /// (spec §4.2 `RecordToolCall`): `messages.tool_call_id` is set to the
    /// new call's id, and the request is appended to the message's
    /// `tool_calls_json` list so a message that issued several calls in one
    /// turn keeps all of them.
    pub async fn record_tool_call(
        &self,
        conversation_id: &str,
        message_id: &str,
        call_id: &str,
        tool_name: &str,
        args: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(MemoryError::from_sqlx)?;

        sqlx::query(
            "INSERT INTO tool_calls (id, conversation_id, tool_name, args, started_at, status)
             VALUES (?, ?, ?, ?, ?, 'active')
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(call_id)
        .bind(conversation_id)
        .bind(tool_name)
        .bind(args)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(MemoryError::from_sqlx)?;

        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT tool_calls_json FROM messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(MemoryError::from_sqlx)?;

        let mut requests: Vec<ToolCallRequest> = existing
            .and_then(|(json,)| json)
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        requests.push(ToolCallRequest {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            args: args.map(str::to_string),
        });
        let requests_json = serde_json::to_string(&requests)
            .map_err(|e| MemoryError::fatal(format!("failed to serialize tool call request: {e}")))?;

        sqlx::query("UPDATE messages SET tool_call_id = ?, tool_calls_json = ? WHERE id = ?")
            .bind(call_id)
            .bind(&requests_json)
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(MemoryError::from_sqlx)?;

        tx.commit().await.map_err(MemoryError::from_sqlx)?;

        Ok(())
    }

    pub async fn complete_tool_call(
        &self,
        call_id: &str,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            "UPDATE tool_calls SET result = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(result)
        .bind(error)
        .bind(&now)
        .bind(call_id)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?
        .rows_affected();

        if affected == 0 {
            return Err(MemoryError::not_found(format!("tool call {call_id}")));
        }
        Ok(())
    }

    pub async fn active_tool_calls(&self, conversation_id: &str, limit: i64) -> Result<Vec<ToolCall>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_calls WHERE conversation_id = ? AND status = 'active'
             ORDER BY started_at ASC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        rows.iter().map(tool_call_from_row).collect()
    }

    pub async fn archive_tool_calls(&self, conversation_id: &str, session_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tool_calls SET status = 'archived', session_id = ?
             WHERE conversation_id = ? AND status != 'archived'",
        )
        .bind(session_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn log() -> MessageLog {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::store::migrate::run(&pool).await.unwrap();
        MessageLog::new(pool)
    }

    #[tokio::test]
    async fn append_creates_conversation_and_message() {
        let log = log().await;
        let msg = log.append_message("c1", Role::User, "hello").await.unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.status, MessageStatus::Active);

        let active = log.active_messages("c1", 10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].content, "hello");
    }

    #[tokio::test]
    async fn archive_is_idempotent() {
        let log = log().await;
        log.append_message("c1", Role::User, "hi").await.unwrap();
        let first = log.archive_messages("c1", "s1", "reset").await.unwrap();
        let second = log.archive_messages("c1", "s1", "reset").await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn messages_for_compaction_excludes_recent_and_system() {
        let log = log().await;
        log.append_message("c1", Role::System, "sys").await.unwrap();
        for i in 0..5 {
            log.append_message("c1", Role::User, &format!("msg {i}")).await.unwrap();
        }
        let candidates = log.messages_for_compaction("c1", 2).await.unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|m| m.role == Role::User));
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let log = log().await;
        let issuing = log.append_message("c1", Role::Assistant, "calling a tool").await.unwrap();
        log.record_tool_call("c1", &issuing.id, "call-1", "search", Some("{}")).await.unwrap();
        log.complete_tool_call("call-1", Some("ok"), None).await.unwrap();

        let active = log.active_tool_calls("c1", 10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].result.as_deref(), Some("ok"));
        assert!(active[0].duration().is_some());

        let all = log.all_messages("c1").await.unwrap();
        let issuing = all.iter().find(|m| m.id == issuing.id).unwrap();
        assert_eq!(issuing.tool_call_id.as_deref(), Some("call-1"));
        assert!(issuing.tool_calls_json.as_deref().unwrap().contains("search"));
    }
}
