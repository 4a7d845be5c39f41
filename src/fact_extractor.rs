// src/fact_extractor.rs
// Post-turn classifier gate + LLM-driven fact persistence (spec §4.8, C9).
// Grounded on the teacher's relationship/facts_service.rs persistence
// shape, generalised behind a capability trait since this crate does not
// own a fact store (spec §1 non-goals).

use crate::config::FactExtractorConfig;
use async_trait::async_trait;
use tracing::warn;

const DEVICE_COMMAND_PREFIXES: &[&str] = &[
    "turn on",
    "turn off",
    "switch on",
    "switch off",
    "set the",
    "set my",
    "what time",
    "what's the time",
    "lock the",
    "unlock the",
    "open the",
    "close the",
];

#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub category: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub worth_persisting: bool,
    pub facts: Vec<ExtractedFact>,
}

/// Persists a single extracted fact to an external fact store.
#[async_trait]
pub trait FactSetter: Send + Sync {
    async fn set_fact(
        &self,
        category: &str,
        key: &str,
        value: &str,
        source: &str,
        confidence: f64,
    ) -> anyhow::Result<()>;
}

/// Injected LLM-driven extraction call (spec §6 `LLMExtract`).
#[async_trait]
pub trait FactExtractionModel: Send + Sync {
    async fn extract(
        &self,
        user_text: &str,
        assistant_text: &str,
        history: &[String],
    ) -> anyhow::Result<ExtractionOutcome>;
}

const AUTO_EXTRACTION_SOURCE: &str = "auto-extraction";

pub struct FactExtractor {
    config: FactExtractorConfig,
}

impl FactExtractor {
    pub fn new(config: FactExtractorConfig) -> Self {
        Self { config }
    }

    /// Four heuristics gating LLM extraction (spec §4.8).
    pub fn should_extract(
        &self,
        user_text: &str,
        assistant_text: &str,
        message_count: i64,
        skip_context: bool,
    ) -> bool {
        if skip_context {
            return false;
        }
        if message_count < self.config.min_messages {
            return false;
        }
        if assistant_text.len() < self.config.min_assistant_chars {
            return false;
        }

        let lowered = user_text.trim().to_lowercase();
        if lowered.len() < 5 {
            return false;
        }
        if DEVICE_COMMAND_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            return false;
        }

        true
    }

    /// Invokes the injected model; on success, persists each fully
    /// populated fact through the injected setter. Individual persistence
    /// failures are logged and skipped; model failure is returned upward
    /// but never cancels the user-facing turn (the caller must swallow
    /// it, per spec §4.8).
    pub async fn extract(
        &self,
        model: &dyn FactExtractionModel,
        setter: &dyn FactSetter,
        user_text: &str,
        assistant_text: &str,
        history: &[String],
    ) -> anyhow::Result<()> {
        let outcome = model.extract(user_text, assistant_text, history).await?;

        if !outcome.worth_persisting {
            return Ok(());
        }

        for fact in outcome.facts {
            if fact.category.is_empty() || fact.key.is_empty() || fact.value.is_empty() {
                continue;
            }
            if let Err(e) = setter
                .set_fact(&fact.category, &fact.key, &fact.value, AUTO_EXTRACTION_SOURCE, fact.confidence)
                .await
            {
                warn!(category = %fact.category, key = %fact.key, error = %e, "fact persistence failed");
            }
        }

        Ok(())
    }
}
