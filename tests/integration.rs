// tests/integration.rs
// Black-box scenarios from the seed end-to-end list (spec §8), exercised
// through the public API only. Uses in-memory SQLite pools the way the
// teacher's own test modules do, plus raw inserts where a scenario needs
// explicit historical timestamps the public append API does not expose.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use convo_memory_core::archive_view::ArchiveView;
use convo_memory_core::archiver_adapter::ArchiverAdapter;
use convo_memory_core::import::ImportService;
use convo_memory_core::message_log::{MessageLog, Role};
use convo_memory_core::search::{SearchEngine, SearchOptions};
use convo_memory_core::session_registry::{SessionRegistry, StartSessionOptions};
use convo_memory_core::store::{migrate, Store};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    migrate::run(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn scenario_two_turn_archive() {
    let pool = pool().await;
    let log = MessageLog::new(pool.clone());
    let sessions = SessionRegistry::new(pool.clone());
    let archive = ArchiveView::new(pool.clone());
    let adapter = ArchiverAdapter::new(log.clone(), sessions.clone(), archive.clone());

    log.append_message("c1", Role::User, "hello").await.unwrap();
    log.append_message("c1", Role::Assistant, "hi there!").await.unwrap();
    let session = adapter.start_session("c1", StartSessionOptions::default()).await.unwrap();

    let archived = adapter.archive_conversation("c1", "reset").await.unwrap();
    assert_eq!(archived, 2);

    let transcript = archive.get_session_transcript(&session.id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
}

#[tokio::test]
async fn scenario_silence_gap_context() {
    let pool = pool().await;

    let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    let offsets_secs: [i64; 5] = [0, 5, 30, 35, 45];
    let mut id = 0;
    for secs in offsets_secs {
        id += 1;
        insert_message_at(&pool, "c1", &format!("m{id}"), "talking about the pool heater", base + ChronoDuration::seconds(secs)).await;
    }
    // A distant cluster, separated by more than the 10 minute silence threshold.
    insert_message_at(&pool, "c1", "m6", "pool heater still broken", base + ChronoDuration::minutes(20)).await;
    insert_message_at(&pool, "c1", "m7", "pool heater update", base + ChronoDuration::minutes(20) + ChronoDuration::seconds(5)).await;

    let engine = SearchEngine::new(pool.clone(), false);
    let options = SearchOptions {
        query: "pool heater".to_string(),
        conversation_id: None,
        silence_threshold_secs: 600,
        max_context_messages: 50,
        max_context_duration_secs: 3600,
        limit: 10,
        no_context: false,
    };

    let hits = engine.search(&options).await.unwrap();
    assert_eq!(hits.len(), 7);

    for hit in &hits {
        let is_early_cluster = hit.message.created_at < base + ChronoDuration::minutes(10);
        let contains_far_cluster = hit
            .context_before
            .iter()
            .chain(hit.context_after.iter())
            .any(|m| m.created_at >= base + ChronoDuration::minutes(20));

        if is_early_cluster {
            assert!(!contains_far_cluster, "early cluster context leaked into the distant cluster");
        }
    }
}

async fn insert_message_at(pool: &SqlitePool, conversation_id: &str, id: &str, content: &str, at: chrono::DateTime<Utc>) {
    sqlx::query("INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING")
        .bind(conversation_id)
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .execute(pool)
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, created_at, token_count, status)
         VALUES (?, ?, 'user', ?, ?, 4, 'active')",
    )
    .bind(id)
    .bind(conversation_id)
    .bind(content)
    .bind(at.to_rfc3339())
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn scenario_iteration_offsetting() {
    let pool = pool().await;
    let sessions = SessionRegistry::new(pool.clone());
    let archive = ArchiveView::new(pool.clone());
    let session = sessions.start_session("c1", StartSessionOptions::default()).await.unwrap();

    let make_batch = |model: &str| {
        vec![
            convo_memory_core::archive_view::NewIteration {
                model: Some(model.to_string()),
                input_tokens: 10,
                output_tokens: 5,
                tool_call_ids: vec![],
                tools_offered: vec![],
                started_at: Utc::now(),
                duration_ms: 10,
                break_reason: None,
            },
            convo_memory_core::archive_view::NewIteration {
                model: Some(model.to_string()),
                input_tokens: 10,
                output_tokens: 5,
                tool_call_ids: vec![],
                tools_offered: vec![],
                started_at: Utc::now(),
                duration_ms: 10,
                break_reason: None,
            },
        ]
    };

    let first = archive.append_iterations(&session.id, make_batch("model-a")).await.unwrap();
    let second = archive.append_iterations(&session.id, make_batch("model-b")).await.unwrap();

    let indices: Vec<i64> = first.iter().chain(second.iter()).map(|i| i.idx).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_ne!(first[0].model, second[0].model);
}

#[tokio::test]
async fn scenario_import_idempotence() {
    let store = Store::connect(&convo_memory_core::config::StoreConfig {
        database_url: "sqlite::memory:".to_string(),
        busy_timeout_ms: 1000,
        max_connections: 1,
    })
    .await
    .unwrap();
    let sessions = SessionRegistry::new(store.pool().clone());
    let import = ImportService::new(store, sessions.clone());

    let session = sessions.start_session("c1", StartSessionOptions::default()).await.unwrap();
    import.record_import("oc-1", "openclaw", &session.id).await.unwrap();
    import.record_import("oc-1", "openclaw", &session.id).await.unwrap();

    assert!(import.is_imported("oc-1", "openclaw").await.unwrap());
    assert!(!import.is_imported("oc-1", "other").await.unwrap());
}

#[tokio::test]
async fn scenario_purge_isolation() {
    let store = Store::connect(&convo_memory_core::config::StoreConfig {
        database_url: "sqlite::memory:".to_string(),
        busy_timeout_ms: 1000,
        max_connections: 1,
    })
    .await
    .unwrap();
    let pool = store.pool().clone();
    let sessions = SessionRegistry::new(pool.clone());
    let log = MessageLog::new(pool.clone());
    let archive = ArchiveView::new(pool.clone());
    let import = ImportService::new(store, sessions.clone());

    let imported1 = sessions.start_session("c-import-1", StartSessionOptions::default()).await.unwrap();
    log.append_message("c-import-1", Role::User, "hi").await.unwrap();
    log.archive_messages("c-import-1", &imported1.id, "import").await.unwrap();
    import.record_import("oc-1", "openclaw", &imported1.id).await.unwrap();

    let imported2 = sessions.start_session("c-import-2", StartSessionOptions::default()).await.unwrap();
    log.append_message("c-import-2", Role::User, "hi again").await.unwrap();
    log.archive_messages("c-import-2", &imported2.id, "import").await.unwrap();
    import.record_import("oc-2", "openclaw", &imported2.id).await.unwrap();

    let native = sessions.start_session("c-native", StartSessionOptions::default()).await.unwrap();
    log.append_message("c-native", Role::User, "native").await.unwrap();
    log.archive_messages("c-native", &native.id, "reset").await.unwrap();

    let purged = import.purge_imported("openclaw").await.unwrap();
    assert_eq!(purged, 2);

    let survivor = archive.get_session_transcript(&native.id).await.unwrap();
    assert_eq!(survivor.len(), 1);

    assert!(!import.is_imported("oc-1", "openclaw").await.unwrap());
    assert!(!import.is_imported("oc-2", "openclaw").await.unwrap());
}

#[tokio::test]
async fn boundary_empty_query_is_invalid() {
    let pool = pool().await;
    let engine = SearchEngine::new(pool, false);
    let err = engine
        .search(&SearchOptions {
            query: String::new(),
            conversation_id: None,
            silence_threshold_secs: 600,
            max_context_messages: 50,
            max_context_duration_secs: 3600,
            limit: 10,
            no_context: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, convo_memory_core::MemoryError::Invalid(_)));
}

#[tokio::test]
async fn boundary_close_orphaned_in_past_matches_zero() {
    let pool = pool().await;
    let sessions = SessionRegistry::new(pool);
    sessions.start_session("c1", StartSessionOptions::default()).await.unwrap();
    let affected = sessions.close_orphaned(Utc::now() - ChronoDuration::days(1)).await.unwrap();
    assert_eq!(affected, 0);
}

#[tokio::test]
async fn scenario_watcher_recovery() {
    use async_trait::async_trait;
    use convo_memory_core::config::WatcherConfig;
    use convo_memory_core::watcher::{HealthProbe, Watcher};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyProbe {
        fails_remaining: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self) -> anyhow::Result<()> {
            let remaining = self.fails_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fails_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("dependency not up yet");
            }
            Ok(())
        }
    }

    let config = WatcherConfig {
        initial_delay_ms: 5,
        max_delay_ms: 20,
        multiplier: 2.0,
        max_startup_attempts: 2,
        poll_interval_ms: 10,
        probe_timeout_ms: 200,
    };

    let watcher = Watcher::watch("dependency", FlakyProbe { fails_remaining: AtomicU32::new(2) }, config, ());

    let mut became_ready = false;
    for _ in 0..100 {
        if watcher.is_ready() {
            became_ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(became_ready, "watcher should become ready after entering steady polling");
    watcher.stop();
    watcher.wait().await;
}

#[tokio::test]
async fn round_trip_session_metadata() {
    let pool = pool().await;
    let sessions = SessionRegistry::new(pool);
    let session = sessions.start_session("c1", StartSessionOptions::default()).await.unwrap();

    let metadata = convo_memory_core::session_registry::SessionMetadata {
        one_liner: Some("quick fix".to_string()),
        paragraph: Some("Helped the user restart the pool heater.".to_string()),
        detailed: None,
        decisions: vec!["restart heater".to_string()],
        participants: vec!["user".to_string()],
        session_type: Some("support".to_string()),
        tools_used: vec!["diagnostics".to_string()],
        files_touched: vec![],
        models: vec!["extractive".to_string()],
    };

    sessions
        .set_session_metadata(&session.id, metadata, Some("Heater fix"), &["home".to_string()])
        .await
        .unwrap();

    let fetched = sessions.get_session(&session.id).await.unwrap();
    assert_eq!(fetched.title.as_deref(), Some("Heater fix"));
    assert_eq!(fetched.tags, vec!["home".to_string()]);
    assert_eq!(fetched.summary.as_deref(), Some("Helped the user restart the pool heater."));
    assert_eq!(fetched.metadata.unwrap().decisions, vec!["restart heater".to_string()]);
}

#[tokio::test]
async fn round_trip_archived_tool_calls() {
    let pool = pool().await;
    let log = MessageLog::new(pool.clone());
    let sessions = SessionRegistry::new(pool.clone());
    let archive = ArchiveView::new(pool.clone());

    let session = sessions.start_session("c1", StartSessionOptions::default()).await.unwrap();
    let issuing = log.append_message("c1", Role::Assistant, "calling a tool").await.unwrap();
    log.record_tool_call("c1", &issuing.id, "call-1", "search", Some("{\"q\":\"pool\"}")).await.unwrap();
    log.complete_tool_call("call-1", Some("3 results"), None).await.unwrap();
    log.archive_tool_calls("c1", &session.id).await.unwrap();

    let archived = archive.get_session_tool_calls(&session.id).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].result.as_deref(), Some("3 results"));
    assert!(archived[0].duration().is_some());
}

#[tokio::test]
async fn boundary_purge_with_no_records_is_a_no_op() {
    let store = Store::connect(&convo_memory_core::config::StoreConfig {
        database_url: "sqlite::memory:".to_string(),
        busy_timeout_ms: 1000,
        max_connections: 1,
    })
    .await
    .unwrap();
    let sessions = SessionRegistry::new(store.pool().clone());
    let import = ImportService::new(store, sessions);
    assert_eq!(import.purge_imported("nothing").await.unwrap(), 0);
}
