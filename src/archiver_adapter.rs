// src/archiver_adapter.rs
// Coordinates session + message + tool-call transitions on reset/shutdown
// (spec §4.6, C7). Grounded on the teacher's memory/features/session.rs
// in-memory session cache: an Arc<RwLock<HashMap<...>>> avoiding a registry
// round trip on every turn.

use crate::archive_view::ArchiveView;
use crate::error::Result;
use crate::message_log::MessageLog;
use crate::session_registry::{Session, SessionRegistry, StartSessionOptions};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct CachedSession {
    session_id: String,
    started_at: DateTime<Utc>,
}

/// Bridges the short interface consumed by the agent driver to the Store
/// (spec §4.6). Holds a small thread-safe cache of per-conversation active
/// session id + start time to avoid per-turn lookups.
#[derive(Clone)]
pub struct ArchiverAdapter {
    log: MessageLog,
    sessions: SessionRegistry,
    archive_view: ArchiveView,
    cache: Arc<RwLock<HashMap<String, CachedSession>>>,
}

impl ArchiverAdapter {
    pub fn new(log: MessageLog, sessions: SessionRegistry, archive_view: ArchiveView) -> Self {
        Self {
            log,
            sessions,
            archive_view,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn start_session(
        &self,
        conversation_id: &str,
        options: StartSessionOptions,
    ) -> Result<Session> {
        let session = self.sessions.start_session(conversation_id, options).await?;
        self.cache.write().insert(
            conversation_id.to_string(),
            CachedSession {
                session_id: session.id.clone(),
                started_at: session.started_at,
            },
        );
        Ok(session)
    }

    /// Deliberately non-summarising (spec §4.6): a background summariser
    /// worker outside this core watches `UnsummarizedSessions` and fills
    /// metadata asynchronously, so metadata is never lost to a shutdown
    /// signal racing a summarisation call.
    pub async fn end_session(&self, conversation_id: &str, reason: &str) -> Result<()> {
        let session_id = match self.cache.write().remove(conversation_id) {
            Some(cached) => cached.session_id,
            None => match self.sessions.active_session(conversation_id).await? {
                Some(s) => s.id,
                None => return Ok(()),
            },
        };
        self.sessions.end_session(&session_id, reason, None).await
    }

    pub fn active_session_id(&self, conversation_id: &str) -> Option<String> {
        self.cache
            .read()
            .get(conversation_id)
            .map(|c| c.session_id.clone())
    }

    pub fn active_session_started_at(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.cache
            .read()
            .get(conversation_id)
            .map(|c| c.started_at)
    }

    /// Get the active session, starting one if none exists.
    pub async fn ensure_session(&self, conversation_id: &str) -> Result<Session> {
        if let Some(cached) = self.cache.read().get(conversation_id).cloned() {
            return self.sessions.get_session(&cached.session_id).await;
        }
        if let Some(session) = self.sessions.active_session(conversation_id).await? {
            self.cache.write().insert(
                conversation_id.to_string(),
                CachedSession {
                    session_id: session.id.clone(),
                    started_at: session.started_at,
                },
            );
            return Ok(session);
        }
        self.start_session(conversation_id, StartSessionOptions::default()).await
    }

    /// Archive every message and tool call in the conversation and link
    /// them to iteration records (spec §4.6 steps 1-5).
    pub async fn archive_conversation(&self, conversation_id: &str, reason: &str) -> Result<u64> {
        let session_id = self
            .active_session_id(conversation_id)
            .or(match self.sessions.active_session(conversation_id).await? {
                Some(s) => Some(s.id),
                None => None,
            })
            .unwrap_or_default();

        let archived_messages = self
            .log
            .archive_messages(conversation_id, &session_id, reason)
            .await?;

        if let Err(e) = self.log.archive_tool_calls(conversation_id, &session_id).await {
            // Tool-call archival failure is logged and does not fail the
            // conversation archival call; messages take priority (spec §7).
            warn!(conversation_id, error = %e, "tool call archival failed");
        }

        if !session_id.is_empty() {
            if let Err(e) = self.archive_view.link_iteration_tool_calls(&session_id).await {
                warn!(session_id, error = %e, "failed linking iteration tool calls");
            }
        }

        info!(conversation_id, session_id, archived_messages, "archived conversation");
        Ok(archived_messages)
    }
}
