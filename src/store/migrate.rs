// src/store/migrate.rs
// Schema migrator: idempotent table/column creation plus the two one-shot
// legacy-layout migrations described in spec §4.1.

use crate::error::{MemoryError, Result};
use crate::store::column_exists;
use sqlx::SqlitePool;
use tracing::{info, warn};

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        end_reason TEXT,
        title TEXT,
        tags_json TEXT,
        metadata_json TEXT,
        summary TEXT,
        parent_session_id TEXT,
        parent_tool_call_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        session_id TEXT,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        token_count INTEGER NOT NULL DEFAULT 0,
        tool_calls_json TEXT,
        tool_call_id TEXT,
        compacted INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'compacted', 'archived')),
        archived_at TEXT,
        archive_reason TEXT,
        iteration_index INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tool_calls (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        session_id TEXT,
        tool_name TEXT NOT NULL,
        args TEXT,
        result TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'archived')),
        iteration_index INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archive_iterations (
        session_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        model TEXT,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        tool_call_count INTEGER NOT NULL DEFAULT 0,
        tool_call_ids_json TEXT,
        tools_offered_json TEXT,
        started_at TEXT NOT NULL,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        had_tool_calls INTEGER NOT NULL DEFAULT 0,
        break_reason TEXT,
        PRIMARY KEY (session_id, idx)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS import_metadata (
        source_id TEXT NOT NULL,
        source_type TEXT NOT NULL,
        archive_session_id TEXT NOT NULL,
        imported_at TEXT NOT NULL,
        PRIMARY KEY (source_id, source_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS working_memory (
        conversation_id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS delegations (
        id TEXT PRIMARY KEY,
        parent_session_id TEXT NOT NULL,
        child_session_id TEXT,
        tool_call_id TEXT,
        created_at TEXT NOT NULL
    )
    "#,
];

const CREATE_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_conv_ts ON messages(conversation_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_conv_status ON messages(conversation_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_tool_calls_name ON tool_calls(tool_name)",
    "CREATE INDEX IF NOT EXISTS idx_tool_calls_conv_status ON tool_calls(conversation_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_iterations_session_idx ON archive_iterations(session_id, idx)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_conv ON sessions(conversation_id)",
];

/// Run the schema migrator. Returns whether the FTS5 text index is
/// available on this SQLite build (spec §4.4 "Index maintenance").
pub async fn run(pool: &SqlitePool) -> Result<bool> {
    for stmt in CREATE_TABLES {
        sqlx::query(stmt).execute(pool).await.map_err(MemoryError::from_sqlx)?;
    }
    for stmt in CREATE_INDICES {
        sqlx::query(stmt).execute(pool).await.map_err(MemoryError::from_sqlx)?;
    }

    // Additive column migrations: probe, then ALTER TABLE ADD COLUMN if
    // missing (spec §4.1). New installs already have every column from
    // CREATE_TABLES above; this loop only fires on stores created before a
    // column was added to the schema.
    add_column_if_missing(pool, "messages", "iteration_index", "INTEGER").await?;
    add_column_if_missing(pool, "messages", "compacted", "INTEGER NOT NULL DEFAULT 0").await?;
    add_column_if_missing(pool, "tool_calls", "iteration_index", "INTEGER").await?;
    add_column_if_missing(pool, "sessions", "parent_tool_call_id", "TEXT").await?;

    let fts_enabled = ensure_fts_index(pool).await;

    Ok(fts_enabled)
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    sql_type: &str,
) -> Result<()> {
    if column_exists(pool, table, column).await? {
        return Ok(());
    }
    crate::store::Store::validate_identifier(table)?;
    crate::store::Store::validate_identifier(column)?;
    let stmt = format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}");
    sqlx::query(&stmt).execute(pool).await.map_err(MemoryError::from_sqlx)?;
    info!(table, column, "added missing column");
    Ok(())
}

/// Create the external-content FTS5 index and its sync triggers. Older
/// SQLite builds without FTS5 compiled in fail the CREATE VIRTUAL TABLE;
/// that failure is not fatal, it just disables the fast search path.
async fn ensure_fts_index(pool: &SqlitePool) -> bool {
    let create = sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content,
            content='messages',
            content_rowid='rowid'
        )
        "#,
    )
    .execute(pool)
    .await;

    if let Err(e) = create {
        warn!(error = %e, "FTS5 unavailable, falling back to substring search");
        return false;
    }

    let triggers = [
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
            INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content) VALUES('delete', old.rowid, old.content);
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content) VALUES('delete', old.rowid, old.content);
            INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
        END
        "#,
    ];

    for stmt in triggers {
        if let Err(e) = sqlx::query(stmt).execute(pool).await {
            warn!(error = %e, "failed to install FTS sync trigger, disabling FTS");
            return false;
        }
    }

    true
}

/// One-shot migration: unify a legacy archive database into the primary
/// store (spec §4.1, migration 1). `legacy_db_path` is a SQLite file that
/// previously held archived messages and tool calls in a separate
/// database. Idempotent: short-circuits when any archived row already
/// exists in the primary.
pub async fn unify_legacy_archive(pool: &SqlitePool, legacy_db_path: &str) -> Result<u64> {
    let already_migrated: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM messages WHERE status = 'archived'")
            .fetch_one(pool)
            .await
            .map_err(MemoryError::from_sqlx)?;
    if already_migrated.0 > 0 {
        info!("legacy archive unification skipped: archived rows already present");
        return Ok(0);
    }

    let attach = format!("ATTACH DATABASE '{legacy_db_path}' AS legacy_archive");
    sqlx::query(&attach)
        .execute(pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

    let result = unify_legacy_archive_inner(pool).await;

    // Always detach, even if the copy failed, so a retry starts clean.
    let _ = sqlx::query("DETACH DATABASE legacy_archive").execute(pool).await;

    result
}

async fn unify_legacy_archive_inner(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await.map_err(MemoryError::from_sqlx)?;

    sqlx::query(
        r#"
        INSERT INTO messages (
            id, conversation_id, session_id, role, content, created_at,
            token_count, status, archived_at, archive_reason
        )
        SELECT
            id, conversation_id, session_id, role, content, created_at,
            COALESCE(token_count, 0), 'archived',
            COALESCE(archived_at, created_at), COALESCE(archive_reason, 'legacy_import')
        FROM legacy_archive.messages
        WHERE true
        ON CONFLICT(id) DO UPDATE SET
            status = 'archived',
            session_id = COALESCE(messages.session_id, excluded.session_id),
            archived_at = COALESCE(messages.archived_at, excluded.archived_at),
            archive_reason = COALESCE(messages.archive_reason, excluded.archive_reason)
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?;

    let affected = sqlx::query(
        r#"
        INSERT INTO tool_calls (
            id, conversation_id, session_id, tool_name, args, result, error,
            started_at, completed_at, status
        )
        SELECT
            id, conversation_id, session_id, tool_name, args, result, error,
            started_at, completed_at, 'archived'
        FROM legacy_archive.tool_calls
        WHERE true
        ON CONFLICT(id) DO UPDATE SET status = 'archived'
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?;

    tx.commit().await.map_err(MemoryError::from_sqlx)?;

    Ok(affected.rows_affected())
}

/// One-shot migration: consolidate sessions, iterations, import metadata,
/// working memory, and delegations from a legacy sidecar database into the
/// primary store (spec §4.1, migration 2). Idempotent: short-circuits when
/// any session row already exists.
pub async fn consolidate_sidecar(pool: &SqlitePool, sidecar_db_path: &str) -> Result<u64> {
    let already_migrated: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
        .fetch_one(pool)
        .await
        .map_err(MemoryError::from_sqlx)?;
    if already_migrated.0 > 0 {
        info!("sidecar consolidation skipped: sessions already present");
        return Ok(0);
    }

    let attach = format!("ATTACH DATABASE '{sidecar_db_path}' AS sidecar");
    sqlx::query(&attach)
        .execute(pool)
        .await
        .map_err(MemoryError::from_sqlx)?;

    let result = consolidate_sidecar_inner(pool).await;
    let _ = sqlx::query("DETACH DATABASE sidecar").execute(pool).await;
    result
}

async fn consolidate_sidecar_inner(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await.map_err(MemoryError::from_sqlx)?;

    let sessions_copied = sqlx::query(
        r#"
        INSERT OR IGNORE INTO sessions (
            id, conversation_id, started_at, ended_at, end_reason,
            title, tags_json, metadata_json, summary, parent_session_id, parent_tool_call_id
        )
        SELECT id, conversation_id, started_at, ended_at, end_reason,
               title, tags_json, metadata_json, summary, parent_session_id, parent_tool_call_id
        FROM sidecar.sessions
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?
    .rows_affected();

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO archive_iterations (
            session_id, idx, model, input_tokens, output_tokens, tool_call_count,
            tool_call_ids_json, tools_offered_json, started_at, duration_ms,
            had_tool_calls, break_reason
        )
        SELECT session_id, idx, model, input_tokens, output_tokens, tool_call_count,
               tool_call_ids_json, tools_offered_json, started_at, duration_ms,
               had_tool_calls, break_reason
        FROM sidecar.archive_iterations
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO import_metadata (source_id, source_type, archive_session_id, imported_at)
        SELECT source_id, source_type, archive_session_id, imported_at FROM sidecar.import_metadata
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO working_memory (conversation_id, content, updated_at)
        SELECT conversation_id, content, updated_at FROM sidecar.working_memory
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO delegations (id, parent_session_id, child_session_id, tool_call_id, created_at)
        SELECT id, parent_session_id, child_session_id, tool_call_id, created_at FROM sidecar.delegations
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(MemoryError::from_sqlx)?;

    tx.commit().await.map_err(MemoryError::from_sqlx)?;

    Ok(sessions_copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let pool = test_pool().await;
        let fts1 = run(&pool).await.unwrap();
        let fts2 = run(&pool).await.unwrap();
        assert_eq!(fts1, fts2);
    }

    #[tokio::test]
    async fn creates_expected_tables() {
        let pool = test_pool().await;
        run(&pool).await.unwrap();

        for table in [
            "conversations",
            "messages",
            "tool_calls",
            "sessions",
            "archive_iterations",
            "import_metadata",
            "working_memory",
            "delegations",
        ] {
            let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(row.0, 0);
        }
    }
}
