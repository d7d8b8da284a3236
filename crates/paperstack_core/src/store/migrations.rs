//! Schema migrations for the local store.
//!
//! Migrations are registered in strictly increasing order and the applied
//! version is mirrored to `PRAGMA user_version`.

use crate::error::{CoreError, CoreResult};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "\
CREATE TABLE documents (
    sync_id     TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    description TEXT,
    category    TEXT,
    labels      TEXT NOT NULL DEFAULT '[]',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    sync_state  TEXT NOT NULL,
    version     INTEGER NOT NULL,
    conflict_id INTEGER
);
CREATE INDEX idx_documents_sync_state ON documents(sync_state);

CREATE TABLE file_attachments (
    owner_sync_id TEXT NOT NULL REFERENCES documents(sync_id) ON DELETE CASCADE,
    file_name     TEXT NOT NULL,
    local_path    TEXT,
    remote_key    TEXT,
    file_size     INTEGER NOT NULL,
    added_at      INTEGER NOT NULL,
    label         TEXT,
    PRIMARY KEY (owner_sync_id, file_name)
);
CREATE INDEX idx_file_attachments_owner ON file_attachments(owner_sync_id);

CREATE TABLE sync_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id     TEXT NOT NULL,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE conflict_snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id     TEXT NOT NULL,
    payload     TEXT NOT NULL,
    detected_at INTEGER NOT NULL
);

CREATE TABLE sync_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
",
}];

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Applies all pending migrations on the provided connection.
pub fn apply_migrations(conn: &mut Connection) -> CoreResult<()> {
    let current = current_user_version(conn)?;
    let latest = latest_version();

    if current > latest {
        return Err(CoreError::constraint(format!(
            "store schema version {current} is newer than supported {latest}"
        )));
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;

    tracing::info!(from = current, to = latest, "applied store migrations");
    Ok(())
}

fn current_user_version(conn: &Connection) -> CoreResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}
