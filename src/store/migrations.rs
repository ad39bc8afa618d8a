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
        name: "workflow_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                received_at TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'received',
                escalation_reason TEXT,
                draft_attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_state ON messages(state);
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);

            CREATE TABLE IF NOT EXISTS triage_decisions (
                message_id TEXT NOT NULL REFERENCES messages(id),
                source TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence REAL,
                reason TEXT,
                decided_at TEXT NOT NULL,
                PRIMARY KEY (message_id, source)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                message_id TEXT PRIMARY KEY REFERENCES messages(id),
                draft_text TEXT NOT NULL,
                final_text TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);
        "#,
    },
    Migration {
        version: 2,
        name: "preference_learning",
        sql: r#"
            CREATE TABLE IF NOT EXISTS preferences (
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                scope TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                evidence_count INTEGER NOT NULL DEFAULT 0,
                staleness REAL NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (kind, value, scope)
            );
            CREATE INDEX IF NOT EXISTS idx_preferences_scope ON preferences(scope);

            CREATE TABLE IF NOT EXISTS sender_contexts (
                address TEXT PRIMARY KEY,
                message_count INTEGER NOT NULL DEFAULT 0,
                replies_sent INTEGER NOT NULL DEFAULT 0,
                denials INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_interaction TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedback_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                outcome TEXT NOT NULL,
                draft_text TEXT NOT NULL,
                final_text TEXT,
                signals TEXT NOT NULL DEFAULT '[]',
                contradictions TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                merged INTEGER NOT NULL DEFAULT 0,
                UNIQUE (message_id, outcome)
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_sender ON feedback_events(sender);
            CREATE INDEX IF NOT EXISTS idx_feedback_merged ON feedback_events(merged);
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

    tracing::debug!(version = get_current_version(conn).await?, "Database migrations complete");
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
        Some(row) => row
            .get(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
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
