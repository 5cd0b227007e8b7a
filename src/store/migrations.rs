//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `apply_all()` checks the
//! current version and applies only the new ones sequentially.

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
            CREATE TABLE IF NOT EXISTS conversation_state (
                user_key TEXT PRIMARY KEY,
                current_state TEXT NOT NULL,
                waiting_for TEXT,
                last_action TEXT,
                last_action_at TEXT,
                onboarding_step TEXT,
                snapshots TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS message_log (
                id TEXT PRIMARY KEY,
                user_key TEXT NOT NULL,
                direction TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_message_log_user
                ON message_log(user_key, created_at);

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL,
                name TEXT NOT NULL,
                invite_code TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                UNIQUE (owner_key, name COLLATE NOCASE)
            );
            CREATE INDEX IF NOT EXISTS idx_groups_owner ON groups(owner_key);

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                PRIMARY KEY (group_id, contact_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "events_and_invitations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL,
                group_id TEXT NOT NULL REFERENCES groups(id),
                title TEXT NOT NULL,
                date TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                location TEXT,
                notes TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_owner ON events(owner_key);

            CREATE TABLE IF NOT EXISTS invitations (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                phone TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sent',
                response TEXT NOT NULL DEFAULT 'no_response',
                responded_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (event_id, contact_id)
            );
            CREATE INDEX IF NOT EXISTS idx_invitations_phone
                ON invitations(phone, created_at);
        "#,
    },
    Migration {
        version: 3,
        name: "polls_and_job_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL,
                group_id TEXT NOT NULL REFERENCES groups(id),
                event_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                created_at TEXT NOT NULL,
                paused_at TEXT,
                stopped_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_polls_owner ON polls(owner_key, created_at);

            CREATE TABLE IF NOT EXISTS poll_options (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                label TEXT NOT NULL,
                starts_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                UNIQUE (poll_id, idx)
            );

            CREATE TABLE IF NOT EXISTS poll_recipients (
                poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                phone TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                responded_at TEXT,
                PRIMARY KEY (poll_id, phone)
            );

            CREATE TABLE IF NOT EXISTS poll_responses (
                poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                phone TEXT NOT NULL,
                option_idx INTEGER,
                PRIMARY KEY (poll_id, phone, option_idx)
            );

            CREATE TABLE IF NOT EXISTS job_queue (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                processed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_queue_due
                ON job_queue(status, scheduled_at);
            -- At most one pending job per (poll, kind): enqueue and
            -- processing run as separate triggers and must tolerate races.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_job_queue_pending_unique
                ON job_queue(poll_id, kind) WHERE status = 'pending';
        "#,
    },
];

/// Apply all pending migrations sequentially.
pub async fn apply_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("record migration: {e}")))?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

/// Highest applied migration version, 0 when none.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version row: {e}")))?;
    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("decode version: {e}"))),
        None => Ok(0),
    }
}
