// src/config.rs
// Configuration structs following the teacher's config/*.rs convention:
// typed fields, a `from_env()` constructor reading std::env::var with
// fallbacks, and a Default impl that delegates to from_env().

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Store connection tunables (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub busy_timeout_ms: u32,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("MEMCORE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            busy_timeout_ms: env_or("MEMCORE_BUSY_TIMEOUT_MS", 5_000),
            max_connections: env_or("MEMCORE_MAX_CONNECTIONS", 1),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Compaction tunables (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    pub max_tokens: i64,
    pub trigger_ratio: f64,
    pub keep_recent: i64,
    pub min_messages_to_compact: i64,
}

impl CompactorConfig {
    pub fn from_env() -> Self {
        Self {
            max_tokens: env_or("MEMCORE_COMPACT_MAX_TOKENS", 8_000),
            trigger_ratio: env_or("MEMCORE_COMPACT_TRIGGER_RATIO", 0.7),
            keep_recent: env_or("MEMCORE_COMPACT_KEEP_RECENT", 10),
            min_messages_to_compact: env_or("MEMCORE_COMPACT_MIN_MESSAGES", 20),
        }
    }

    pub fn trigger_threshold(&self) -> f64 {
        self.max_tokens as f64 * self.trigger_ratio
    }
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Search defaults (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub silence_threshold_secs: i64,
    pub max_context_messages: i64,
    pub max_context_duration_secs: i64,
    pub default_limit: i64,
}

impl SearchConfig {
    pub fn from_env() -> Self {
        Self {
            silence_threshold_secs: env_or("MEMCORE_SEARCH_SILENCE_SECS", 600),
            max_context_messages: env_or("MEMCORE_SEARCH_MAX_CONTEXT_MESSAGES", 50),
            max_context_duration_secs: env_or("MEMCORE_SEARCH_MAX_CONTEXT_SECS", 3_600),
            default_limit: env_or("MEMCORE_SEARCH_DEFAULT_LIMIT", 10),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Service watcher pool defaults (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_startup_attempts: u32,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl WatcherConfig {
    pub fn from_env() -> Self {
        Self {
            initial_delay_ms: env_or("MEMCORE_WATCHER_INITIAL_DELAY_MS", 2_000),
            max_delay_ms: env_or("MEMCORE_WATCHER_MAX_DELAY_MS", 60_000),
            multiplier: env_or("MEMCORE_WATCHER_MULTIPLIER", 2.0),
            max_startup_attempts: env_or("MEMCORE_WATCHER_MAX_ATTEMPTS", 10),
            poll_interval_ms: env_or("MEMCORE_WATCHER_POLL_INTERVAL_MS", 60_000),
            probe_timeout_ms: env_or("MEMCORE_WATCHER_PROBE_TIMEOUT_MS", 10_000),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Fact extraction tunables (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactExtractorConfig {
    pub min_messages: i64,
    pub min_assistant_chars: usize,
    pub extraction_timeout_secs: u64,
}

impl FactExtractorConfig {
    pub fn from_env() -> Self {
        Self {
            min_messages: env_or("MEMCORE_EXTRACT_MIN_MESSAGES", 4),
            min_assistant_chars: env_or("MEMCORE_EXTRACT_MIN_ASSISTANT_CHARS", 20),
            extraction_timeout_secs: env_or("MEMCORE_EXTRACT_TIMEOUT_SECS", 30),
        }
    }
}

impl Default for FactExtractorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
