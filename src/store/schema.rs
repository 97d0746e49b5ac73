//! Schema definition and versioned, idempotent migrations.
//!
//! A `metadata` singleton table carries `schema_version`; each
//! migration step is guarded so re-running it on an already-migrated
//! database is a no-op (`pragma_table_info` checks before `ALTER TABLE
//! ADD COLUMN`).

use crate::error::{CoreError, CoreResult};
use rusqlite::Connection;
use tracing::{info, warn};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

pub fn init_schema(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         PRAGMA cache_size=-64000;
         PRAGMA foreign_keys=ON;",
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    let version = schema_version(conn)?;
    if version == 0 {
        apply_v1(conn)?;
        set_schema_version(conn, 1)?;
    }
    if schema_version(conn)? < 2 {
        migrate_v1_to_v2(conn)?;
        set_schema_version(conn, 2)?;
    }

    info!(version = CURRENT_SCHEMA_VERSION, "event store schema up to date");
    Ok(())
}

fn schema_version(conn: &Connection) -> CoreResult<i64> {
    let v: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [version.to_string()],
    )?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> CoreResult<bool> {
    let sql = format!("PRAGMA table_info({table})");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn apply_v1(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            type TEXT NOT NULL,
            name TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            event_count INTEGER NOT NULL DEFAULT 0,
            video_path TEXT,
            video_offset INTEGER,
            video_duration INTEGER,
            metadata TEXT NOT NULL DEFAULT '{}',
            config TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX idx_sessions_device ON sessions(device_id);
        CREATE INDEX idx_sessions_status ON sessions(status);
        CREATE INDEX idx_sessions_start_time ON sessions(start_time DESC);

        CREATE TABLE events (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            relative_time INTEGER NOT NULL,
            duration INTEGER,
            source TEXT NOT NULL,
            category TEXT NOT NULL,
            type TEXT NOT NULL,
            level TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            step_id TEXT,
            trace_id TEXT,
            aggregate_count INTEGER,
            aggregate_first INTEGER,
            aggregate_last INTEGER,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            parent_event_id TEXT,
            generated_by_plugin TEXT
        );
        CREATE INDEX idx_events_session_reltime ON events(session_id, relative_time);
        CREATE INDEX idx_events_session_timestamp ON events(session_id, timestamp);
        CREATE INDEX idx_events_device_timestamp ON events(device_id, timestamp);
        CREATE INDEX idx_events_session_source ON events(session_id, source);
        CREATE INDEX idx_events_session_type ON events(session_id, type);
        CREATE INDEX idx_events_session_level ON events(session_id, level);
        CREATE INDEX idx_events_session_trace ON events(session_id, trace_id);

        CREATE TABLE event_data (
            event_id TEXT PRIMARY KEY REFERENCES events(id) ON DELETE CASCADE,
            data BLOB NOT NULL,
            data_size INTEGER NOT NULL
        );

        CREATE TABLE time_index (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            second INTEGER NOT NULL,
            event_count INTEGER NOT NULL,
            first_event_id TEXT NOT NULL,
            has_error INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, second)
        );

        CREATE TABLE bookmarks (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            relative_time INTEGER NOT NULL,
            label TEXT NOT NULL,
            color TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL DEFAULT 'manual',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_bookmarks_session ON bookmarks(session_id);

        CREATE TABLE assertions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            assertion_type TEXT NOT NULL,
            criteria TEXT NOT NULL,
            expected TEXT,
            is_template INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE assertion_results (
            id TEXT PRIMARY KEY,
            assertion_id TEXT NOT NULL REFERENCES assertions(id) ON DELETE CASCADE,
            session_id TEXT NOT NULL,
            passed INTEGER NOT NULL,
            matched_event_ids TEXT NOT NULL DEFAULT '[]',
            actual TEXT,
            expected TEXT,
            duration_ms INTEGER NOT NULL,
            executed_at INTEGER NOT NULL
        );
        CREATE INDEX idx_assertion_results_assertion ON assertion_results(assertion_id);

        CREATE TABLE assertion_sets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            assertion_ids TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        );

        CREATE TABLE plugin_state (
            plugin_id TEXT PRIMARY KEY,
            state TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

/// v1 -> v2: adds the optional full-text index over title/summary.
/// Creation is best-effort: FTS5 may be unavailable in a given SQLite
/// build, and its absence must only downgrade search, never fail the
/// store.
fn migrate_v1_to_v2(conn: &Connection) -> CoreResult<()> {
    if has_column(conn, "events", "__fts_marker")? {
        return Ok(());
    }
    let result = conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
            title, summary, content=events, content_rowid=rowid, tokenize='porter unicode61'
        );
        CREATE TRIGGER IF NOT EXISTS events_fts_ai AFTER INSERT ON events BEGIN
            INSERT INTO events_fts(rowid, title, summary) VALUES (new.rowid, new.title, new.summary);
        END;
        CREATE TRIGGER IF NOT EXISTS events_fts_ad AFTER DELETE ON events BEGIN
            INSERT INTO events_fts(events_fts, rowid, title, summary) VALUES ('delete', old.rowid, old.title, old.summary);
        END;
        CREATE TRIGGER IF NOT EXISTS events_fts_au AFTER UPDATE ON events BEGIN
            INSERT INTO events_fts(events_fts, rowid, title, summary) VALUES ('delete', old.rowid, old.title, old.summary);
            INSERT INTO events_fts(rowid, title, summary) VALUES (new.rowid, new.title, new.summary);
        END;",
    );
    if let Err(e) = result {
        warn!(error = %e, "FTS5 unavailable; full-text search will fall back to substring matching");
    }
    Ok(())
}

/// Returns true if the `events_fts` virtual table exists and is usable.
pub fn fts_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name='events_fts'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

pub fn map_err(e: rusqlite::Error) -> CoreError {
    CoreError::from(e)
}
