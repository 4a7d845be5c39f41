// src/compactor.rs
// Token accounting, eligibility gating, summariser invocation, marking
// (spec §4.5, C6).

use crate::config::CompactorConfig;
use crate::error::Result;
use crate::message_log::MessageLog;
use crate::summarizer::Summariser;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing::{info, warn};

/// Optional attachment giving the summariser verbatim experiential context
/// (spec §4.5 step 2). Out-of-scope collaborators implement this; the core
/// only defines the contract.
#[async_trait]
pub trait WorkingMemoryReader: Send + Sync {
    async fn read(&self, conversation_id: &str) -> Result<Option<String>>;
}

pub struct Compactor {
    log: MessageLog,
    config: CompactorConfig,
    summariser: Arc<dyn Summariser>,
    working_memory: Option<Arc<dyn WorkingMemoryReader>>,
}

impl Compactor {
    pub fn new(log: MessageLog, config: CompactorConfig, summariser: Arc<dyn Summariser>) -> Self {
        Self {
            log,
            config,
            summariser,
            working_memory: None,
        }
    }

    pub fn with_working_memory(mut self, reader: Arc<dyn WorkingMemoryReader>) -> Self {
        self.working_memory = Some(reader);
        self
    }

    pub async fn needs_compaction(&self, conversation_id: &str) -> Result<bool> {
        let tokens = self.log.token_count(conversation_id).await?;
        Ok(tokens as f64 > self.config.trigger_threshold())
    }

    /// Compact-then-append is deliberate (spec §4.5): a crash between steps
    /// leaves candidates marked compacted but no summary appended, which is
    /// detectable (a compacted run with no following synthetic summary
    /// message) and safe to retry.
    pub async fn compact(&self, conversation_id: &str) -> Result<()> {
        let candidates = self
            .log
            .messages_for_compaction(conversation_id, self.config.keep_recent)
            .await?;

        if (candidates.len() as i64) < self.config.min_messages_to_compact {
            return Ok(());
        }

        let working_memory_text = match &self.working_memory {
            Some(reader) => reader.read(conversation_id).await.unwrap_or(None),
            None => None,
        };

        let summary = match self
            .summariser
            .summarise(&candidates, working_memory_text.as_deref())
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(conversation_id, error = %e, "summariser failed, compaction deferred");
                return Ok(());
            }
        };

        let first = &candidates[0];
        let last = candidates.last().unwrap();
        let header = format!(
            "Conversation Summary ({} messages, {} to {})",
            candidates.len(),
            first.created_at.to_rfc3339(),
            last.created_at.to_rfc3339(),
        );

        let cutoff = last.created_at + ChronoDuration::milliseconds(1);
        self.log.mark_compacted(conversation_id, cutoff).await?;

        let body = format!("{header}\n\n{summary}");
        self.log.add_compaction_summary(conversation_id, &body).await?;

        info!(conversation_id, compacted = candidates.len(), "compacted conversation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::Role;
    use crate::summarizer::ExtractiveSummariser;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn compactor(min_messages: i64, keep_recent: i64) -> (Compactor, MessageLog) {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::store::migrate::run(&pool).await.unwrap();
        let log = MessageLog::new(pool);
        let config = CompactorConfig {
            max_tokens: 8_000,
            trigger_ratio: 0.7,
            keep_recent,
            min_messages_to_compact: min_messages,
        };
        let compactor = Compactor::new(log.clone(), config, Arc::new(ExtractiveSummariser::default()));
        (compactor, log)
    }

    #[tokio::test]
    async fn below_minimum_is_a_no_op() {
        let (compactor, log) = compactor(20, 2).await;
        log.append_message("c1", Role::User, "hi").await.unwrap();
        compactor.compact("c1").await.unwrap();

        let active = log.active_messages("c1", 10).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn compacts_and_appends_summary() {
        let (compactor, log) = compactor(3, 1).await;
        for i in 0..5 {
            log.append_message("c1", Role::User, &format!("turn {i}")).await.unwrap();
        }
        compactor.compact("c1").await.unwrap();

        let all = log.all_messages("c1").await.unwrap();
        let compacted = all
            .iter()
            .filter(|m| m.status == crate::message_log::MessageStatus::Compacted)
            .count();
        let summaries = all.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(compacted, 4);
        assert_eq!(summaries, 1);
    }
}
