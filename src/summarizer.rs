// src/summarizer.rs
// Abstract summarisation operation plus an extractive fallback (spec §4.5
// step 3). Grounded on the teacher's capability-trait pattern in
// memory/core/traits.rs: a narrow async trait, the LLM-backed
// implementation living outside this crate's scope (spec §1 non-goals).

use crate::message_log::{Message, Role};
use async_trait::async_trait;

/// Summarises an ordered run of messages, optionally informed by verbatim
/// working-memory text. The LLM-backed implementation is an external
/// collaborator (spec §1); this crate only defines the contract plus a
/// deterministic fallback.
#[async_trait]
pub trait Summariser: Send + Sync {
    async fn summarise(
        &self,
        messages: &[Message],
        working_memory: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// Pulls short user turns as bullet topics and counts tool turns as
/// actions. Used when no LLM-backed summariser is configured, or as a test
/// double.
pub struct ExtractiveSummariser {
    pub max_topic_chars: usize,
}

impl Default for ExtractiveSummariser {
    fn default() -> Self {
        Self { max_topic_chars: 80 }
    }
}

#[async_trait]
impl Summariser for ExtractiveSummariser {
    async fn summarise(
        &self,
        messages: &[Message],
        working_memory: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut topics = Vec::new();
        let mut actions = 0usize;

        for message in messages {
            match message.role {
                Role::User if message.content.len() <= self.max_topic_chars => {
                    topics.push(message.content.clone());
                }
                Role::Tool => actions += 1,
                _ => {}
            }
        }

        let mut out = String::new();
        if let Some(wm) = working_memory {
            if !wm.trim().is_empty() {
                out.push_str("Working memory:\n");
                out.push_str(wm.trim());
                out.push_str("\n\n");
            }
        }

        if topics.is_empty() {
            out.push_str("No short user topics identified.\n");
        } else {
            out.push_str("Topics:\n");
            for topic in &topics {
                out.push_str("- ");
                out.push_str(topic);
                out.push('\n');
            }
        }

        out.push_str(&format!("Tool actions taken: {actions}\n"));
        Ok(out)
    }
}
