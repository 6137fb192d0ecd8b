//! Repository schema migrations
//!
//! The stored `PRAGMA user_version` is the authoritative schema gate. A
//! fresh database gets the full latest schema and is stamped directly to
//! [`LATEST_VERSION`]; an existing database replays every migration past
//! its stored version inside one transaction. Any failure rolls the whole
//! batch back and the repository refuses to open.

use crate::error::{ProcsiError, Result};
use rusqlite::Connection;

/// Current schema version.
pub const LATEST_VERSION: i64 = 3;

/// Full schema at [`LATEST_VERSION`], applied to fresh databases.
const FULL_SCHEMA: &str = "
CREATE TABLE sessions (
    id              TEXT PRIMARY KEY,
    label           TEXT,
    source          TEXT,
    pid             INTEGER NOT NULL,
    started_at      INTEGER NOT NULL,
    internal_token  TEXT
);

CREATE TABLE requests (
    id                       TEXT PRIMARY KEY,
    session_id               TEXT NOT NULL REFERENCES sessions(id),
    timestamp                INTEGER NOT NULL,
    duration_ms              INTEGER,
    method                   TEXT NOT NULL,
    url                      TEXT NOT NULL,
    host                     TEXT NOT NULL,
    path                     TEXT NOT NULL,
    request_headers          TEXT NOT NULL DEFAULT '{}',
    request_body             BLOB,
    request_body_truncated   INTEGER NOT NULL DEFAULT 0,
    request_content_type     TEXT,
    request_is_text          INTEGER,
    request_is_json          INTEGER,
    response_status          INTEGER,
    response_headers         TEXT,
    response_body            BLOB,
    response_body_truncated  INTEGER,
    response_content_type    TEXT,
    response_is_text         INTEGER,
    response_is_json         INTEGER,
    label                    TEXT,
    source                   TEXT,
    intercepted_by           TEXT,
    interception_type        TEXT,
    replayed_from_id         TEXT,
    replay_initiator         TEXT,
    saved                    INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_requests_timestamp ON requests(timestamp DESC);
CREATE INDEX idx_requests_session_id ON requests(session_id);
CREATE INDEX idx_requests_label ON requests(label);
CREATE INDEX idx_requests_method ON requests(method);
CREATE INDEX idx_requests_response_status ON requests(response_status);
CREATE INDEX idx_requests_host ON requests(host);
";

/// Apply pending migrations, or install the full schema on a fresh file.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version == 0 && !table_exists(conn, "sessions")? {
        let tx = conn.transaction()?;
        tx.execute_batch(FULL_SCHEMA)
            .map_err(|e| ProcsiError::Migration(format!("Failed to install schema: {e}")))?;
        tx.pragma_update(None, "user_version", LATEST_VERSION)?;
        tx.commit()?;
        tracing::debug!(version = LATEST_VERSION, "Installed fresh schema");
        return Ok(());
    }

    if version > LATEST_VERSION {
        return Err(ProcsiError::Migration(format!(
            "Database schema version {version} is newer than supported {LATEST_VERSION}"
        ))
        .into());
    }

    if version == LATEST_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for pending in (version + 1)..=LATEST_VERSION {
        apply_step(&tx, pending)
            .map_err(|e| ProcsiError::Migration(format!("Migration to v{pending} failed: {e}")))?;
        tracing::info!(version = pending, "Applied schema migration");
    }
    tx.pragma_update(None, "user_version", LATEST_VERSION)?;
    tx.commit()
        .map_err(|e| ProcsiError::Migration(format!("Migration commit failed: {e}")))?;
    Ok(())
}

/// One migration step. Steps are idempotent: re-running against a schema
/// that already has the column or index is a no-op.
fn apply_step(tx: &rusqlite::Transaction<'_>, version: i64) -> rusqlite::Result<()> {
    match version {
        // v1: base tables. Only reachable on databases predating
        // user_version stamping; the guard keeps it idempotent.
        1 => {
            if !table_exists_tx(tx, "sessions")? {
                tx.execute_batch(
                    "CREATE TABLE sessions (
                        id TEXT PRIMARY KEY, label TEXT, source TEXT,
                        pid INTEGER NOT NULL, started_at INTEGER NOT NULL,
                        internal_token TEXT
                    );
                    CREATE TABLE requests (
                        id TEXT PRIMARY KEY,
                        session_id TEXT NOT NULL REFERENCES sessions(id),
                        timestamp INTEGER NOT NULL, duration_ms INTEGER,
                        method TEXT NOT NULL, url TEXT NOT NULL,
                        host TEXT NOT NULL, path TEXT NOT NULL,
                        request_headers TEXT NOT NULL DEFAULT '{}',
                        request_body BLOB,
                        request_body_truncated INTEGER NOT NULL DEFAULT 0,
                        request_content_type TEXT,
                        response_status INTEGER, response_headers TEXT,
                        response_body BLOB, response_body_truncated INTEGER,
                        response_content_type TEXT,
                        label TEXT, source TEXT,
                        saved INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX idx_requests_timestamp ON requests(timestamp DESC);
                    CREATE INDEX idx_requests_session_id ON requests(session_id);
                    CREATE INDEX idx_requests_label ON requests(label);
                    CREATE INDEX idx_requests_method ON requests(method);
                    CREATE INDEX idx_requests_response_status ON requests(response_status);
                    CREATE INDEX idx_requests_host ON requests(host);",
                )?;
            }
        }
        // v2: interception and replay attribution.
        2 => {
            add_column(tx, "requests", "intercepted_by", "TEXT")?;
            add_column(tx, "requests", "interception_type", "TEXT")?;
            add_column(tx, "requests", "replayed_from_id", "TEXT")?;
            add_column(tx, "requests", "replay_initiator", "TEXT")?;
        }
        // v3: content-type classification columns for index-friendly
        // body-search eligibility.
        3 => {
            add_column(tx, "requests", "request_is_text", "INTEGER")?;
            add_column(tx, "requests", "request_is_json", "INTEGER")?;
            add_column(tx, "requests", "response_is_text", "INTEGER")?;
            add_column(tx, "requests", "response_is_json", "INTEGER")?;
        }
        other => {
            return Err(rusqlite::Error::InvalidParameterName(format!(
                "unknown migration version {other}"
            )))
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_exists_tx(tx: &rusqlite::Transaction<'_>, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(tx: &rusqlite::Transaction<'_>, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    if !column_exists(tx, table, column)? {
        tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_is_stamped_latest() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, LATEST_VERSION);
        assert!(table_exists(&conn, "requests").unwrap());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
    }

    #[test]
    fn test_v1_database_upgrades_in_place() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Simulate a database created before the interception columns.
        {
            let tx = conn.transaction().unwrap();
            apply_step(&tx, 1).unwrap();
            tx.pragma_update(None, "user_version", 1).unwrap();
            tx.commit().unwrap();
        }

        migrate(&mut conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, LATEST_VERSION);
        // The added columns are queryable.
        conn.execute_batch("SELECT intercepted_by, request_is_json FROM requests LIMIT 0")
            .unwrap();
    }

    #[test]
    fn test_newer_schema_refuses_to_open() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.pragma_update(None, "user_version", LATEST_VERSION + 5)
            .unwrap();
        assert!(migrate(&mut conn).is_err());
    }
}
