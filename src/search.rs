// src/search.rs
// Full-text search with gap-aware context expansion (spec §4.4, C5).
// Grounded on the teacher's memory/storage/sqlite/core.rs query idiom, with
// the materialise-then-expand split spec §5 calls for: the driver must not
// issue a dependent query while a result cursor from the primary query is
// still open on the same connection.

use crate::error::{MemoryError, Result};
use crate::message_log::{message_from_row, Message};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub conversation_id: Option<String>,
    pub silence_threshold_secs: i64,
    pub max_context_messages: i64,
    pub max_context_duration_secs: i64,
    pub limit: i64,
    pub no_context: bool,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>, defaults: &crate::config::SearchConfig) -> Self {
        Self {
            query: query.into(),
            conversation_id: None,
            silence_threshold_secs: defaults.silence_threshold_secs,
            max_context_messages: defaults.max_context_messages,
            max_context_duration_secs: defaults.max_context_duration_secs,
            limit: defaults.default_limit,
            no_context: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message: Message,
    pub context_before: Vec<Message>,
    pub context_after: Vec<Message>,
    pub highlight: Option<String>,
}

/// Text index management, query sanitisation, gap-aware context walks
/// (spec §4.4).
#[derive(Clone)]
pub struct SearchEngine {
    pool: SqlitePool,
    fts_enabled: bool,
}

impl SearchEngine {
    pub fn new(pool: SqlitePool, fts_enabled: bool) -> Self {
        Self { pool, fts_enabled }
    }

    /// Tokenise on whitespace, wrap each token in double quotes with
    /// internal quotes doubled, join with OR. Prevents special characters
    /// common in entity identifiers (`.`, `:`, `(`, `)`) from being parsed
    /// as FTS5 query operators (spec §4.4 step 1).
    fn sanitise(query: &str) -> String {
        query
            .split_whitespace()
            .map(|tok| format!("\"{}\"", tok.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    pub async fn search(&self, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        if options.query.trim().is_empty() {
            return Err(MemoryError::invalid("empty query"));
        }

        let matches = if self.fts_enabled {
            self.primary_query_fts(options).await?
        } else {
            self.primary_query_substring(options).await?
        };

        debug!(query = %options.query, matches = matches.len(), fts = self.fts_enabled, "search matched");

        if options.no_context {
            return Ok(matches
                .into_iter()
                .map(|(message, highlight)| SearchHit {
                    message,
                    context_before: Vec::new(),
                    context_after: Vec::new(),
                    highlight,
                })
                .collect());
        }

        let mut hits = Vec::with_capacity(matches.len());
        for (message, highlight) in matches {
            let (before, after) = match self.expand_context(&message, options).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "context expansion failed");
                    (Vec::new(), Vec::new())
                }
            };
            hits.push(SearchHit {
                message,
                context_before: before,
                context_after: after,
                highlight,
            });
        }

        Ok(hits)
    }

    async fn primary_query_fts(&self, options: &SearchOptions) -> Result<Vec<(Message, Option<String>)>> {
        let fts_query = Self::sanitise(&options.query);

        let sql = if options.conversation_id.is_some() {
            "SELECT m.*, snippet(messages_fts, 0, '[', ']', '...', 10) as snippet
             FROM messages_fts
             JOIN messages m ON m.rowid = messages_fts.rowid
             WHERE messages_fts MATCH ? AND m.conversation_id = ?
             ORDER BY rank LIMIT ?"
        } else {
            "SELECT m.*, snippet(messages_fts, 0, '[', ']', '...', 10) as snippet
             FROM messages_fts
             JOIN messages m ON m.rowid = messages_fts.rowid
             WHERE messages_fts MATCH ?
             ORDER BY rank LIMIT ?"
        };

        let mut query = sqlx::query(sql).bind(&fts_query);
        if let Some(conv) = &options.conversation_id {
            query = query.bind(conv);
        }
        query = query.bind(options.limit);

        let rows = query.fetch_all(&self.pool).await.map_err(MemoryError::from_sqlx)?;

        rows.iter()
            .map(|row| {
                let message = message_from_row(row)?;
                let highlight: Option<String> = row.try_get("snippet").ok();
                Ok((message, highlight))
            })
            .collect()
    }

    async fn primary_query_substring(&self, options: &SearchOptions) -> Result<Vec<(Message, Option<String>)>> {
        let needle = format!("%{}%", options.query);

        let sql = if options.conversation_id.is_some() {
            "SELECT * FROM messages WHERE content LIKE ? AND conversation_id = ?
             ORDER BY created_at DESC LIMIT ?"
        } else {
            "SELECT * FROM messages WHERE content LIKE ? ORDER BY created_at DESC LIMIT ?"
        };

        let mut query = sqlx::query(sql).bind(&needle);
        if let Some(conv) = &options.conversation_id {
            query = query.bind(conv);
        }
        query = query.bind(options.limit);

        let rows = query.fetch_all(&self.pool).await.map_err(MemoryError::from_sqlx)?;

        rows.iter()
            .map(|row| message_from_row(row).map(|m| (m, None)))
            .collect()
    }

    /// Walk chronologically adjacent rows outward from `message` in both
    /// directions, stopping at any silence gap exceeding the threshold
    /// (spec §4.4 step 4).
    async fn expand_context(&self, message: &Message, options: &SearchOptions) -> Result<(Vec<Message>, Vec<Message>)> {
        let max_duration = ChronoDuration::seconds(options.max_context_duration_secs);

        let mut backward = self
            .walk(
                message,
                options,
                message.created_at - max_duration,
                message.created_at,
                false,
            )
            .await?;
        backward.reverse();

        let forward = self
            .walk(
                message,
                options,
                message.created_at,
                message.created_at + max_duration,
                true,
            )
            .await?;

        Ok((backward, forward))
    }

    async fn walk(
        &self,
        anchor: &Message,
        options: &SearchOptions,
        lower: chrono::DateTime<chrono::Utc>,
        upper: chrono::DateTime<chrono::Utc>,
        forward: bool,
    ) -> Result<Vec<Message>> {
        let order = if forward { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT * FROM messages WHERE conversation_id = ? AND id != ?
             AND created_at > ? AND created_at < ?
             ORDER BY created_at {order} LIMIT ?"
        );

        let rows = sqlx::query(&sql)
            .bind(&anchor.conversation_id)
            .bind(&anchor.id)
            .bind(lower.to_rfc3339())
            .bind(upper.to_rfc3339())
            .bind(options.max_context_messages)
            .fetch_all(&self.pool)
            .await
            .map_err(MemoryError::from_sqlx)?;

        let threshold = ChronoDuration::seconds(options.silence_threshold_secs);
        let mut cursor = anchor.created_at;
        let mut out = Vec::new();

        for row in &rows {
            let candidate = message_from_row(row)?;
            let gap = if forward {
                candidate.created_at - cursor
            } else {
                cursor - candidate.created_at
            };
            if gap > threshold {
                break;
            }
            cursor = candidate.created_at;
            out.push(candidate);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::{MessageLog, Role};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn engine_without_fts() -> (SearchEngine, MessageLog) {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::store::migrate::run(&pool).await.unwrap();
        (SearchEngine::new(pool.clone(), false), MessageLog::new(pool))
    }

    fn options(query: &str) -> SearchOptions {
        SearchOptions {
            query: query.to_string(),
            conversation_id: None,
            silence_threshold_secs: 600,
            max_context_messages: 50,
            max_context_duration_secs: 3600,
            limit: 10,
            no_context: false,
        }
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let (engine, _log) = engine_without_fts().await;
        let err = engine.search(&options("   ")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Invalid(_)));
    }

    #[tokio::test]
    async fn substring_fallback_finds_match() {
        let (engine, log) = engine_without_fts().await;
        log.append_message("c1", Role::User, "the pool heater is broken").await.unwrap();
        let hits = engine.search(&options("pool heater")).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn query_with_special_characters_does_not_error() {
        let (engine, log) = engine_without_fts().await;
        log.append_message("c1", Role::User, "entity id a.b:c(1)").await.unwrap();
        let hits = engine.search(&options("a.b:c(1)")).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
