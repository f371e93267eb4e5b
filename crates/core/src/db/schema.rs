//! Table definitions and the migration runner.
//!
//! The SQLite `user_version` pragma records the last applied migration.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// `(version, description, sql)` triples, applied in ascending order.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "history graph",
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commits (
            id          TEXT PRIMARY KEY,
            project_id  TEXT NOT NULL REFERENCES projects (id),
            parents     TEXT NOT NULL,
            author      TEXT NOT NULL,
            message     TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            manifest    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_commits_project ON commits (project_id);

        CREATE TABLE IF NOT EXISTS branches (
            id          TEXT PRIMARY KEY,
            project_id  TEXT    NOT NULL REFERENCES projects (id),
            name        TEXT    NOT NULL,
            tip         TEXT    NOT NULL REFERENCES commits (id),
            version     INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT    NOT NULL,
            UNIQUE (project_id, name)
        );

        CREATE TABLE IF NOT EXISTS file_versions (
            id           TEXT PRIMARY KEY,
            path         TEXT    NOT NULL,
            content_hash TEXT    NOT NULL,
            size         INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_file_versions_content ON file_versions (content_hash);
        "#,
    ),
    (
        2,
        "merge requests and audit log",
        r#"
        CREATE TABLE IF NOT EXISTS merge_requests (
            id            TEXT PRIMARY KEY,
            project_id    TEXT NOT NULL REFERENCES projects (id),
            source_branch TEXT NOT NULL REFERENCES branches (id),
            target_branch TEXT NOT NULL REFERENCES branches (id),
            status        TEXT NOT NULL,
            data          TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_merge_requests_project ON merge_requests (project_id);
        CREATE INDEX IF NOT EXISTS idx_merge_requests_status ON merge_requests (status);

        CREATE TABLE IF NOT EXISTS audit_log (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            action           TEXT NOT NULL,
            project_id       TEXT,
            merge_request_id TEXT,
            commit_id        TEXT,
            actor            TEXT,
            details          TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    ),
];

/// Schema version this build writes.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |&(version, _, _)| version)
}

/// Bring `conn` up to [`latest_version`]. Each migration and its version
/// bump commit together, so an interrupted upgrade resumes cleanly.
///
/// A database stamped with a newer version than this build knows is
/// refused rather than opened read-write.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let found = get_schema_version(conn)?;
    let latest = latest_version();
    if found > latest {
        return Err(DatabaseError::MigrationFailed {
            version: found,
            detail: format!("database schema v{found} is newer than supported v{latest}"),
        });
    }
    if found == latest {
        debug!(version = found, "database schema is current");
        return Ok(());
    }

    for &(version, description, sql) in MIGRATIONS.iter().filter(|m| m.0 > found) {
        info!(version, description, "applying migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| DatabaseError::MigrationFailed {
                version,
                detail: e.to_string(),
            })?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    info!(from = found, to = latest, "database schema upgraded");
    Ok(())
}

/// Schema version stored in the `user_version` pragma (0 for a new file).
pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
