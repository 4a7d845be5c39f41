// src/lib.rs
// Conversation memory core: durable message log, sessions, archive,
// search, compaction, import/purge, fact extraction, and a service
// watcher pool for a long-lived agent runtime.
//
// The crate does not install a tracing subscriber or read `.env` files
// itself — both are owned by the out-of-scope CLI/host process that links
// this library, matching the teacher's split between library crates and
// `main.rs`.

pub mod archive_view;
pub mod archiver_adapter;
pub mod compactor;
pub mod config;
pub mod error;
pub mod fact_extractor;
pub mod ids;
pub mod import;
pub mod message_log;
pub mod search;
pub mod session_registry;
pub mod store;
pub mod summarizer;
pub mod watcher;

pub use error::{MemoryError, Result};
pub use store::Store;

/// Convenience bundle wiring every component over one Store, the way a
/// host process typically constructs the core at startup.
///
/// `Compactor`, `FactExtractor` and `WatcherManager` are not fields here:
/// each needs a host-supplied collaborator this crate has no default for
/// (a `Summariser`, a `FactExtractionModel` + `FactSetter`, or a set of
/// named `HealthProbe`s), so the host constructs them directly once it has
/// those collaborators in hand, passing `message_log.clone()` or nothing
/// at all as the constructor requires.
pub struct MemoryCore {
    pub store: Store,
    pub message_log: message_log::MessageLog,
    pub sessions: session_registry::SessionRegistry,
    pub archive: archive_view::ArchiveView,
    pub search: search::SearchEngine,
    pub archiver: archiver_adapter::ArchiverAdapter,
    pub import: import::ImportService,
}

impl MemoryCore {
    pub async fn connect(config: &config::StoreConfig) -> Result<Self> {
        let store = Store::connect(config).await?;
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: Store) -> Self {
        let pool = store.pool().clone();
        let message_log = message_log::MessageLog::new(pool.clone());
        let sessions = session_registry::SessionRegistry::new(pool.clone());
        let archive = archive_view::ArchiveView::new(pool.clone());
        let search = search::SearchEngine::new(pool.clone(), store.fts_enabled());
        let archiver = archiver_adapter::ArchiverAdapter::new(message_log.clone(), sessions.clone(), archive.clone());
        let import = import::ImportService::new(store.clone(), sessions.clone());

        Self {
            store,
            message_log,
            sessions,
            archive,
            search,
            archiver,
            import,
        }
    }

    /// Reap sessions left active by a prior crash. Call once at process
    /// start before accepting new turns (spec §4.3).
    pub async fn close_orphaned_sessions(&self, before: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        self.sessions.close_orphaned(before).await
    }
}
