//! Schema migrations
//!
//! Forward-only and idempotent: each migration is applied at most once per
//! database file, tracked in `schema_version`. Migration bodies inspect
//! existing state before mutating it, so re-opening a database written by
//! an older build of this crate is always safe.

use rusqlite::Connection;
use tracing::info;

use super::sqlite::Result;
use crate::storage::sqlite::StorageError;

/// A single forward migration step.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: fn(&Connection) -> Result<()>,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "create memories, memory_versions, settings_overrides, rate_limits",
    up: migration_1,
}];

fn migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id              TEXT NOT NULL,
            user_id                 TEXT NOT NULL,
            memory_date             TEXT NOT NULL,
            subject                 TEXT NOT NULL,
            importance              INTEGER NOT NULL,
            access_mode             TEXT NOT NULL,
            state                   TEXT NOT NULL,
            supersedes_memory_id    INTEGER,
            confidence_score        REAL NOT NULL,
            source                  TEXT NOT NULL,
            content_hash            TEXT NOT NULL,
            created_at              TIMESTAMP NOT NULL,
            FOREIGN KEY (supersedes_memory_id) REFERENCES memories(id)
        );

        CREATE TABLE IF NOT EXISTS memory_versions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_id   INTEGER NOT NULL,
            content     TEXT NOT NULL,
            version     INTEGER NOT NULL,
            timestamp   TIMESTAMP NOT NULL,
            UNIQUE(memory_id, version),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS settings_overrides (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TIMESTAMP NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rate_limits (
            user_id         TEXT NOT NULL,
            endpoint        TEXT NOT NULL,
            window_start    INTEGER NOT NULL,
            request_count   INTEGER NOT NULL,
            PRIMARY KEY (user_id, endpoint, window_start)
        );

        CREATE INDEX IF NOT EXISTS idx_memories_session_user_subject
            ON memories(session_id, user_id, subject);",
    )?;

    // De-duplicate before the partial unique index can be created: any
    // pre-existing active rows that would collide on (user_id,
    // content_hash) get their hash rewritten, keeping the lowest id per
    // group as the surviving active fact. On a fresh database this is a
    // no-op; it only matters when upgrading a file carrying pre-migration
    // rows inserted by a tool that bypassed the index.
    conn.execute(
        "UPDATE memories
         SET content_hash = lower(hex(randomblob(16)))
         WHERE state = 'active'
           AND id NOT IN (
               SELECT MIN(id) FROM memories
               WHERE state = 'active'
               GROUP BY user_id, content_hash
           )",
        [],
    )?;

    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_active_memories_hash
            ON memories(user_id, content_hash) WHERE state = 'active';",
    )?;

    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TIMESTAMP NOT NULL
        );",
    )?;

    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(None);

    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the database's recorded version, in
/// order. Returns the schema version the database ends up at.
pub fn apply_migrations(conn: &Connection) -> Result<u32> {
    let current = get_current_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "applying schema migration"
        );

        (migration.up)(conn).map_err(|e| {
            StorageError::Init(format!(
                "migration {} ({}) failed: {e}",
                migration.version, migration.description
            ))
        })?;

        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().to_rfc3339()],
        )?;
    }

    Ok(CURRENT_SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&conn).unwrap(), 1);
        // Re-running against the same connection must not error or
        // re-apply.
        assert_eq!(apply_migrations(&conn).unwrap(), 1);

        let version = get_current_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn active_uniqueness_index_exists() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        let sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE name = 'idx_active_memories_hash'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(sql.contains("WHERE state = 'active'"));
    }
}
