//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS automation_settings (
                workspace_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 0,
                mode TEXT NOT NULL DEFAULT 'shadow',
                historical_policy TEXT NOT NULL DEFAULT 'manual_backlog_only',
                enabled_at TEXT,
                min_confidence INTEGER NOT NULL DEFAULT 70,
                incremental_max_conversations INTEGER NOT NULL DEFAULT 25,
                catchup_max_conversations INTEGER NOT NULL DEFAULT 200,
                classify_on_any_message INTEGER NOT NULL DEFAULT 0,
                apply_temperature INTEGER NOT NULL DEFAULT 1,
                manual_lock_enabled INTEGER NOT NULL DEFAULT 1,
                uncertain_new_lead_window_hours INTEGER NOT NULL DEFAULT 24,
                uncertain_existing_phase TEXT NOT NULL DEFAULT 'keep_current',
                allow_setter_trigger INTEGER NOT NULL DEFAULT 0,
                backfill_state TEXT NOT NULL DEFAULT 'pending',
                backfill_completed_at TEXT,
                last_incremental_run_at TEXT,
                last_catchup_run_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_automation_settings_enabled
                ON automation_settings(enabled);

            CREATE TABLE IF NOT EXISTS workspace_locks (
                workspace_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tags (
                workspace_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                prompt_text TEXT,
                PRIMARY KEY (workspace_id, id)
            );

            CREATE TABLE IF NOT EXISTS conversation_threads (
                workspace_id TEXT NOT NULL,
                id TEXT NOT NULL,
                contact_name TEXT,
                last_message_at TEXT,
                last_message_direction TEXT,
                lead_status TEXT NOT NULL DEFAULT 'open',
                is_spam INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                ai_phase_updated_at TEXT,
                ai_phase_confidence INTEGER,
                ai_temperature_confidence INTEGER,
                ai_phase_reason TEXT,
                ai_phase_mode TEXT,
                ai_phase_last_run_source TEXT,
                PRIMARY KEY (workspace_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_threads_recency
                ON conversation_threads(workspace_id, last_message_at);

            CREATE TABLE IF NOT EXISTS thread_messages (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                text TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_thread_messages_conversation
                ON thread_messages(workspace_id, conversation_id, sent_at);

            CREATE TABLE IF NOT EXISTS conversation_tags (
                workspace_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                tag_id TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'manual',
                created_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, conversation_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS automation_audit (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                conversation_id TEXT,
                action TEXT NOT NULL,
                actor_user_id TEXT,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_workspace
                ON automation_audit(workspace_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_conversation
                ON automation_audit(workspace_id, conversation_id);
        "#,
    },
    Migration {
        version: 2,
        name: "runs_and_retag_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS automation_runs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                source TEXT NOT NULL,
                summary TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_automation_runs_workspace
                ON automation_runs(workspace_id, started_at);

            CREATE TABLE IF NOT EXISTS retag_jobs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                tag_id TEXT,
                only_last_30_days INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                progress_total INTEGER NOT NULL DEFAULT 0,
                progress_done INTEGER NOT NULL DEFAULT 0,
                message TEXT,
                error TEXT,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_retag_jobs_workspace
                ON retag_jobs(workspace_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_retag_jobs_status ON retag_jobs(status);

            CREATE TABLE IF NOT EXISTS workspace_knowledge (
                workspace_id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "single_active_full_retag",
        sql: r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_retag_jobs_active_full_scope
                ON retag_jobs(workspace_id)
                WHERE tag_id IS NULL
                  AND only_last_30_days = 0
                  AND status IN ('queued', 'running');
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "automation_settings",
            "workspace_locks",
            "tags",
            "conversation_threads",
            "thread_messages",
            "conversation_tags",
            "automation_audit",
            "automation_runs",
            "retag_jobs",
            "workspace_knowledge",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "runs_and_retag_jobs");

        let row3 = rows.next().await.unwrap().unwrap();
        let n3: String = row3.get(1).unwrap();
        assert_eq!(n3, "single_active_full_retag");
    }
}
