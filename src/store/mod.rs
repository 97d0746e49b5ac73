//! The durable, local, single-writer tabular event store.
//!
//! A dedicated OS thread owns the write connection and drains a
//! bounded channel in batches, while reads go through an `r2d2` pool of
//! separate connections against the same WAL-mode database file.

mod codec;
pub mod query;
mod schema;

use crate::error::{CoreError, CoreResult};
use crate::events::{Assertion, AssertionResult, Bookmark, Event, Session, TimeIndexEntry};
use query::{EventQuery, QueryPage};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Target capacity of the in-memory write buffer before a flush is forced.
    pub flush_batch_size: usize,
    /// Periodic flush tick when the buffer hasn't reached `flush_batch_size`.
    pub flush_interval: Duration,
    /// Bounded write-intake channel depth.
    pub channel_buffer: usize,
    /// Events older than this are eligible for periodic cleanup; `None` disables it.
    pub retention_days: Option<u32>,
    pub read_pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_path: PathBuf::from("devbench.db"),
            flush_batch_size: 500,
            flush_interval: Duration::from_millis(500),
            channel_buffer: 1000,
            retention_days: Some(90),
            read_pool_size: 4,
        }
    }
}

#[derive(Default)]
pub struct StoreMetrics {
    pub events_written: AtomicU64,
    pub flushes: AtomicU64,
    pub write_errors: AtomicU64,
}

impl StoreMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.events_written.load(Ordering::Relaxed),
            self.flushes.load(Ordering::Relaxed),
            self.write_errors.load(Ordering::Relaxed),
        )
    }
}

type Responder<T> = std_mpsc::Sender<CoreResult<T>>;

enum WriterCommand {
    WriteEvent(Event),
    WriteEventDirect(Event, Responder<()>),
    Flush(Responder<()>),
    CreateSession(Session, Responder<()>),
    UpdateSession(Session, Responder<()>),
    DeleteSession(String, Responder<()>),
    UpsertTimeIndex(String, TimeIndexEntry, Responder<()>),
    CreateBookmark(Bookmark, Responder<()>),
    DeleteBookmark(String, Responder<()>),
    UpsertAssertion(Assertion, Responder<()>),
    DeleteAssertion(String, Responder<()>),
    WriteAssertionResult(AssertionResult, Responder<()>),
    CleanupOlderThan(i64, Responder<u64>),
    Vacuum(Responder<()>),
    UpsertPluginState(String, serde_json::Value, Responder<()>),
    Shutdown(Responder<()>),
}

pub struct EventStore {
    cmd_tx: std_mpsc::SyncSender<WriterCommand>,
    read_pool: r2d2::Pool<SqliteConnectionManager>,
    metrics: Arc<StoreMetrics>,
    writer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventStore {
    pub fn open(config: StoreConfig) -> CoreResult<Self> {
        let manager = SqliteConnectionManager::file(&config.db_path);
        let read_pool = r2d2::Pool::builder()
            .max_size(config.read_pool_size)
            .build(manager)
            .map_err(|e| CoreError::fatal(format!("failed to open read pool: {e}")))?;

        // Bring schema up to date once, through a dedicated connection,
        // before either the writer thread or any reader touches the file.
        {
            let conn = read_pool
                .get()
                .map_err(|e| CoreError::fatal(format!("failed to open db: {e}")))?;
            schema::init_schema(&conn)?;
        }

        let metrics = Arc::new(StoreMetrics::default());
        let (cmd_tx, cmd_rx) = std_mpsc::sync_channel(config.channel_buffer);

        let writer_config = config.clone();
        let writer_metrics = metrics.clone();
        let handle = std::thread::Builder::new()
            .name("event-store-writer".to_string())
            .spawn(move || writer_thread(writer_config, cmd_rx, writer_metrics))
            .map_err(|e| CoreError::fatal(format!("failed to spawn writer thread: {e}")))?;

        Ok(EventStore {
            cmd_tx,
            read_pool,
            metrics,
            writer_handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn metrics(&self) -> Arc<StoreMetrics> {
        self.metrics.clone()
    }

    /// Buffered write; non-blocking. Returns `Overload` if the writer's
    /// intake channel is full rather than blocking the caller.
    pub fn write_event(&self, event: Event) -> CoreResult<()> {
        self.cmd_tx
            .try_send(WriterCommand::WriteEvent(event))
            .map_err(|_| CoreError::overload("event store intake is full"))
    }

    /// Synchronous write: bypasses the buffer, commits immediately.
    pub async fn write_event_direct(&self, event: Event) -> CoreResult<()> {
        self.call(|tx| WriterCommand::WriteEventDirect(event, tx)).await
    }

    pub async fn flush(&self) -> CoreResult<()> {
        self.call(WriterCommand::Flush).await
    }

    pub async fn create_session(&self, session: Session) -> CoreResult<()> {
        self.call(|tx| WriterCommand::CreateSession(session, tx)).await
    }

    pub async fn update_session(&self, session: Session) -> CoreResult<()> {
        self.call(|tx| WriterCommand::UpdateSession(session, tx)).await
    }

    pub async fn delete_session(&self, id: String) -> CoreResult<()> {
        self.call(|tx| WriterCommand::DeleteSession(id, tx)).await
    }

    pub async fn upsert_time_index(&self, session_id: String, entry: TimeIndexEntry) -> CoreResult<()> {
        self.call(|tx| WriterCommand::UpsertTimeIndex(session_id, entry, tx)).await
    }

    pub async fn create_bookmark(&self, bookmark: Bookmark) -> CoreResult<()> {
        self.call(|tx| WriterCommand::CreateBookmark(bookmark, tx)).await
    }

    pub async fn delete_bookmark(&self, id: String) -> CoreResult<()> {
        self.call(|tx| WriterCommand::DeleteBookmark(id, tx)).await
    }

    pub async fn upsert_assertion(&self, assertion: Assertion) -> CoreResult<()> {
        self.call(|tx| WriterCommand::UpsertAssertion(assertion, tx)).await
    }

    pub async fn delete_assertion(&self, id: String) -> CoreResult<()> {
        self.call(|tx| WriterCommand::DeleteAssertion(id, tx)).await
    }

    pub async fn write_assertion_result(&self, result: AssertionResult) -> CoreResult<()> {
        self.call(|tx| WriterCommand::WriteAssertionResult(result, tx)).await
    }

    /// Deletes events (and cascading rows) with `timestamp` older than
    /// `older_than_ms`; returns the number of sessions touched isn't
    /// tracked, callers get the number of events removed.
    pub async fn cleanup_older_than(&self, older_than_ms: i64) -> CoreResult<u64> {
        self.call(|tx| WriterCommand::CleanupOlderThan(older_than_ms, tx)).await
    }

    pub async fn vacuum(&self) -> CoreResult<()> {
        self.call(WriterCommand::Vacuum).await
    }

    /// Persists a plugin's `state` bag; called on each coalesced flush
    /// and unconditionally on `PluginManager` shutdown so state survives
    /// a restart.
    pub async fn upsert_plugin_state(&self, plugin_id: String, state: serde_json::Value) -> CoreResult<()> {
        self.call(|tx| WriterCommand::UpsertPluginState(plugin_id, state, tx)).await
    }

    pub async fn get_plugin_state(&self, plugin_id: String) -> CoreResult<Option<serde_json::Value>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let result: Option<String> = conn
                .query_row(
                    "SELECT state FROM plugin_state WHERE plugin_id = ?1",
                    params![plugin_id],
                    |row| row.get(0),
                )
                .ok();
            Ok(result.and_then(|s| serde_json::from_str(&s).ok()))
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    pub async fn query_events(&self, q: EventQuery) -> CoreResult<QueryPage> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            query::query_events(&conn, &q)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    pub async fn get_event(&self, id: String) -> CoreResult<Option<Event>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            query::get_event(&conn, &id)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    pub async fn get_session(&self, id: String) -> CoreResult<Option<Session>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            read_session(&conn, &id)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    pub async fn list_sessions(&self, device_id: Option<String>, limit: i64) -> CoreResult<Vec<Session>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            list_sessions(&conn, device_id.as_deref(), limit)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    /// Rebuilds the time index for a session from live events rather
    /// than reading the persisted `time_index` table, which is kept
    /// write-only.
    pub async fn get_time_index(&self, session_id: String) -> CoreResult<Vec<TimeIndexEntry>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            rebuild_time_index(&conn, &session_id)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    pub async fn list_bookmarks(&self, session_id: String) -> CoreResult<Vec<Bookmark>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            list_bookmarks(&conn, &session_id)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    pub async fn list_assertions(&self) -> CoreResult<Vec<Assertion>> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            list_assertions(&conn)
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    async fn call<T, F>(&self, make_cmd: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Responder<T>) -> WriterCommand + Send + 'static,
    {
        let tx = self.cmd_tx.clone();
        tokio::task::spawn_blocking(move || {
            let (resp_tx, resp_rx) = std_mpsc::channel();
            tx.send(make_cmd(resp_tx))
                .map_err(|_| CoreError::fatal("event store writer has shut down"))?;
            resp_rx
                .recv()
                .map_err(|_| CoreError::fatal("event store writer dropped the response"))?
        })
        .await
        .map_err(|e| CoreError::fatal(format!("blocking task join error: {e}")))?
    }

    /// Closes intake and waits for the writer to drain, per the
    /// shutdown cascade's "close store" step.
    pub async fn shutdown(&self) -> CoreResult<()> {
        let result = self.call(WriterCommand::Shutdown).await;
        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        result
    }
}

fn writer_thread(config: StoreConfig, cmd_rx: std_mpsc::Receiver<WriterCommand>, metrics: Arc<StoreMetrics>) {
    let conn = match open_write_connection(&config.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "event store writer failed to open database");
            return;
        }
    };

    let mut buffer: Vec<Event> = Vec::with_capacity(1000);
    let mut last_flush = Instant::now();

    loop {
        let timeout = config.flush_interval;
        match cmd_rx.recv_timeout(timeout) {
            Ok(WriterCommand::WriteEvent(event)) => {
                buffer.push(event);
                if buffer.len() >= config.flush_batch_size {
                    flush_batch(&conn, &mut buffer, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(WriterCommand::WriteEventDirect(event, resp)) => {
                let result = write_event_row(&conn, &event);
                let _ = resp.send(result);
            }
            Ok(WriterCommand::Flush(resp)) => {
                flush_batch(&conn, &mut buffer, &metrics);
                last_flush = Instant::now();
                let _ = resp.send(Ok(()));
            }
            Ok(WriterCommand::CreateSession(session, resp)) => {
                let _ = resp.send(create_session(&conn, &session));
            }
            Ok(WriterCommand::UpdateSession(session, resp)) => {
                let _ = resp.send(update_session(&conn, &session));
            }
            Ok(WriterCommand::DeleteSession(id, resp)) => {
                let _ = resp.send(
                    conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
                        .map(|_| ())
                        .map_err(CoreError::from),
                );
            }
            Ok(WriterCommand::UpsertTimeIndex(session_id, entry, resp)) => {
                let _ = resp.send(upsert_time_index(&conn, &session_id, &entry));
            }
            Ok(WriterCommand::CreateBookmark(bookmark, resp)) => {
                let _ = resp.send(create_bookmark(&conn, &bookmark));
            }
            Ok(WriterCommand::DeleteBookmark(id, resp)) => {
                let _ = resp.send(
                    conn.execute("DELETE FROM bookmarks WHERE id = ?1", params![id])
                        .map(|_| ())
                        .map_err(CoreError::from),
                );
            }
            Ok(WriterCommand::UpsertAssertion(assertion, resp)) => {
                let _ = resp.send(upsert_assertion(&conn, &assertion));
            }
            Ok(WriterCommand::DeleteAssertion(id, resp)) => {
                let _ = resp.send(
                    conn.execute("DELETE FROM assertions WHERE id = ?1", params![id])
                        .map(|_| ())
                        .map_err(CoreError::from),
                );
            }
            Ok(WriterCommand::WriteAssertionResult(result, resp)) => {
                let _ = resp.send(write_assertion_result(&conn, &result));
            }
            Ok(WriterCommand::CleanupOlderThan(cutoff, resp)) => {
                let _ = resp.send(
                    conn.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff])
                        .map(|n| n as u64)
                        .map_err(CoreError::from),
                );
            }
            Ok(WriterCommand::Vacuum(resp)) => {
                let _ = resp.send(conn.execute_batch("VACUUM").map_err(CoreError::from));
            }
            Ok(WriterCommand::UpsertPluginState(plugin_id, state, resp)) => {
                let _ = resp.send(upsert_plugin_state(&conn, &plugin_id, &state));
            }
            Ok(WriterCommand::Shutdown(resp)) => {
                flush_batch(&conn, &mut buffer, &metrics);
                let _ = resp.send(Ok(()));
                info!("event store writer shutting down");
                return;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if !buffer.is_empty() && last_flush.elapsed() >= config.flush_interval {
                    flush_batch(&conn, &mut buffer, &metrics);
                    last_flush = Instant::now();
                }
                if let Some(days) = config.retention_days {
                    maybe_run_retention(&conn, days);
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                flush_batch(&conn, &mut buffer, &metrics);
                return;
            }
        }
    }
}

fn open_write_connection(path: &Path) -> CoreResult<Connection> {
    let conn = Connection::open(path)?;
    schema::init_schema(&conn)?;
    Ok(conn)
}

/// Drains `buffer` in one transaction, one row per event plus one
/// payload row per non-empty `data`. A per-row error is logged and
/// skipped rather than aborting the whole batch; a transaction-level
/// SQL error rolls back the entire flush and the buffer is NOT restored —
/// losing a bursty batch on catastrophic failure is acceptable.
fn flush_batch(conn: &Connection, buffer: &mut Vec<Event>, metrics: &StoreMetrics) {
    if buffer.is_empty() {
        return;
    }
    let batch_size = buffer.len();
    let events = std::mem::take(buffer);

    let result: rusqlite::Result<()> = (|| {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        for event in &events {
            if let Err(e) = insert_event_row(conn, event) {
                warn!(event_id = %event.id, error = %e, "dropping event row in batch");
                metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            metrics.events_written.fetch_add(1, Ordering::Relaxed);
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    })();

    if let Err(e) = result {
        error!(batch_size, error = %e, "flush transaction failed, batch lost");
        let _ = conn.execute_batch("ROLLBACK");
        metrics.write_errors.fetch_add(batch_size as u64, Ordering::Relaxed);
    } else {
        metrics.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(batch_size, "flushed event batch");
    }
}

fn write_event_row(conn: &Connection, event: &Event) -> CoreResult<()> {
    insert_event_row(conn, event).map_err(CoreError::from)
}

fn insert_event_row(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events (id, session_id, device_id, timestamp, relative_time, duration, source, category,
            type, level, title, summary, parent_id, step_id, trace_id, aggregate_count, aggregate_first,
            aggregate_last, tags, metadata, parent_event_id, generated_by_plugin)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
        params![
            event.id,
            event.session_id,
            event.device_id,
            event.timestamp,
            event.relative_time,
            event.duration,
            query::source_as_str(event.source),
            query::category_as_str(event.category),
            event.event_type,
            query::level_as_str(event.level),
            event.title,
            event.summary,
            event.parent_id,
            event.step_id,
            event.trace_id,
            event.aggregate_count,
            event.aggregate_first,
            event.aggregate_last,
            serde_json::to_string(&event.tags).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
            event.parent_event_id,
            event.generated_by_plugin,
        ],
    )?;

    if let Some(data) = &event.data {
        let raw = serde_json::to_vec(data).unwrap_or_default();
        if !raw.is_empty() {
            let encoded = codec::encode_payload(&raw);
            conn.execute(
                "INSERT INTO event_data (event_id, data, data_size) VALUES (?1, ?2, ?3)",
                params![event.id, encoded, raw.len() as i64],
            )?;
        }
    }
    Ok(())
}

fn create_session(conn: &Connection, s: &Session) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO sessions (id, device_id, type, name, start_time, end_time, status, event_count,
            video_path, video_offset, video_duration, metadata, config, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        params![
            s.id,
            s.device_id,
            s.session_type,
            s.name,
            s.start_time,
            s.end_time,
            session_status_str(s.status),
            s.event_count as i64,
            s.video_path,
            s.video_offset,
            s.video_duration,
            serde_json::to_string(&s.metadata).unwrap_or_else(|_| "{}".to_string()),
            serde_json::to_string(&s.config).unwrap_or_else(|_| "{}".to_string()),
            s.created_at,
            s.updated_at,
        ],
    )?;
    Ok(())
}

fn update_session(conn: &Connection, s: &Session) -> CoreResult<()> {
    conn.execute(
        "UPDATE sessions SET end_time=?2, status=?3, event_count=?4, video_path=?5, video_offset=?6,
            video_duration=?7, metadata=?8, updated_at=?9 WHERE id=?1",
        params![
            s.id,
            s.end_time,
            session_status_str(s.status),
            s.event_count as i64,
            s.video_path,
            s.video_offset,
            s.video_duration,
            serde_json::to_string(&s.metadata).unwrap_or_else(|_| "{}".to_string()),
            s.updated_at,
        ],
    )?;
    Ok(())
}

fn session_status_str(status: crate::events::SessionStatus) -> &'static str {
    use crate::events::SessionStatus::*;
    match status {
        Active => "active",
        Closed => "closed",
        Aborted => "aborted",
    }
}

fn read_session(conn: &Connection, id: &str) -> CoreResult<Option<Session>> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, type, name, start_time, end_time, status, event_count, video_path,
                video_offset, video_duration, metadata, config, created_at, updated_at
         FROM sessions WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![id], row_to_session)?;
    match rows.next() {
        Some(r) => Ok(Some(r?)),
        None => Ok(None),
    }
}

fn list_sessions(conn: &Connection, device_id: Option<&str>, limit: i64) -> CoreResult<Vec<Session>> {
    let (sql, use_device) = if device_id.is_some() {
        (
            "SELECT id, device_id, type, name, start_time, end_time, status, event_count, video_path,
                    video_offset, video_duration, metadata, config, created_at, updated_at
             FROM sessions WHERE device_id = ?1 ORDER BY start_time DESC LIMIT ?2",
            true,
        )
    } else {
        (
            "SELECT id, device_id, type, name, start_time, end_time, status, event_count, video_path,
                    video_offset, video_duration, metadata, config, created_at, updated_at
             FROM sessions ORDER BY start_time DESC LIMIT ?1",
            false,
        )
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = if use_device {
        stmt.query_map(params![device_id.unwrap(), limit], row_to_session)?
    } else {
        stmt.query_map(params![limit], row_to_session)?
    };
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get(6)?;
    let metadata_json: String = row.get(11)?;
    let config_json: String = row.get(12)?;
    Ok(Session {
        id: row.get(0)?,
        device_id: row.get(1)?,
        session_type: row.get(2)?,
        name: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        status: match status.as_str() {
            "closed" => crate::events::SessionStatus::Closed,
            "aborted" => crate::events::SessionStatus::Aborted,
            _ => crate::events::SessionStatus::Active,
        },
        event_count: row.get::<_, i64>(7)? as u64,
        video_path: row.get(8)?,
        video_offset: row.get(9)?,
        video_duration: row.get(10)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        config: serde_json::from_str(&config_json).unwrap_or_default(),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn upsert_time_index(conn: &Connection, session_id: &str, entry: &TimeIndexEntry) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO time_index (session_id, second, event_count, first_event_id, has_error)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(session_id, second) DO UPDATE SET
            event_count = excluded.event_count,
            first_event_id = excluded.first_event_id,
            has_error = excluded.has_error",
        params![session_id, entry.second, entry.event_count as i64, entry.first_event_id, entry.has_error],
    )?;
    Ok(())
}

/// Rebuilds `(second, event_count, first_event_id, has_error)` for a
/// session directly from `events`, bucketing `relative_time / 1000`.
fn rebuild_time_index(conn: &Connection, session_id: &str) -> CoreResult<Vec<TimeIndexEntry>> {
    let mut stmt = conn.prepare(
        "SELECT relative_time / 1000 AS second, COUNT(*), MIN(id), MAX(level IN ('error','fatal'))
         FROM events WHERE session_id = ?1 GROUP BY second ORDER BY second",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok(TimeIndexEntry {
            second: row.get(0)?,
            event_count: row.get::<_, i64>(1)? as u64,
            first_event_id: row.get(2)?,
            has_error: row.get::<_, i64>(3)? != 0,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn create_bookmark(conn: &Connection, b: &Bookmark) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO bookmarks (id, session_id, relative_time, label, color, type, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            b.id,
            b.session_id,
            b.relative_time,
            b.label,
            b.color,
            match b.bookmark_type {
                crate::events::BookmarkType::Manual => "manual",
                crate::events::BookmarkType::Auto => "auto",
            },
            b.created_at,
        ],
    )?;
    Ok(())
}

fn list_bookmarks(conn: &Connection, session_id: &str) -> CoreResult<Vec<Bookmark>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, relative_time, label, color, type, created_at
         FROM bookmarks WHERE session_id = ?1 ORDER BY relative_time ASC",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        let bt: String = row.get(5)?;
        Ok(Bookmark {
            id: row.get(0)?,
            session_id: row.get(1)?,
            relative_time: row.get(2)?,
            label: row.get(3)?,
            color: row.get(4)?,
            bookmark_type: if bt == "auto" {
                crate::events::BookmarkType::Auto
            } else {
                crate::events::BookmarkType::Manual
            },
            created_at: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn upsert_assertion(conn: &Connection, a: &Assertion) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO assertions (id, name, assertion_type, criteria, expected, is_template, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(id) DO UPDATE SET name=excluded.name, assertion_type=excluded.assertion_type,
            criteria=excluded.criteria, expected=excluded.expected, is_template=excluded.is_template",
        params![
            a.id,
            a.name,
            serde_json::to_string(&a.assertion_type).unwrap_or_default(),
            serde_json::to_string(&a.criteria).unwrap_or_default(),
            a.expected.as_ref().map(|v| v.to_string()),
            a.is_template,
            a.created_at,
        ],
    )?;
    Ok(())
}

fn list_assertions(conn: &Connection) -> CoreResult<Vec<Assertion>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, assertion_type, criteria, expected, is_template, created_at FROM assertions",
    )?;
    let rows = stmt.query_map([], |row| {
        let type_json: String = row.get(2)?;
        let criteria_json: String = row.get(3)?;
        let expected_json: Option<String> = row.get(4)?;
        Ok(Assertion {
            id: row.get(0)?,
            name: row.get(1)?,
            assertion_type: serde_json::from_str(&type_json).unwrap_or(crate::events::AssertionType::Exists),
            criteria: serde_json::from_str(&criteria_json).unwrap_or_default(),
            expected: expected_json.and_then(|s| serde_json::from_str(&s).ok()),
            is_template: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn write_assertion_result(conn: &Connection, r: &AssertionResult) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO assertion_results (id, assertion_id, session_id, passed, matched_event_ids, actual,
            expected, duration_ms, executed_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        params![
            r.id,
            r.assertion_id,
            r.session_id,
            r.passed,
            serde_json::to_string(&r.matched_event_ids).unwrap_or_default(),
            r.actual.as_ref().map(|v| v.to_string()),
            r.expected.as_ref().map(|v| v.to_string()),
            r.duration_ms,
            r.executed_at,
        ],
    )?;
    Ok(())
}

fn upsert_plugin_state(conn: &Connection, plugin_id: &str, state: &serde_json::Value) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO plugin_state (plugin_id, state, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(plugin_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        params![plugin_id, state.to_string(), chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

/// Runs retention cleanup at most once per tick cadence; cheap check,
/// real cost is the DELETE which only fires when there's anything to do.
fn maybe_run_retention(conn: &Connection, retention_days: u32) {
    let cutoff = chrono::Utc::now().timestamp_millis() - (retention_days as i64 * 86_400_000);
    if let Err(e) = conn.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff]) {
        warn!(error = %e, "retention cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventCategory, EventLevel, EventSource, SessionConfig};

    fn test_store() -> (EventStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = EventStore::open(StoreConfig {
            db_path,
            flush_batch_size: 2,
            flush_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn write_then_query_round_trips_payload() {
        let (store, _dir) = test_store();
        let session = Session::new("s1", "D1", "manual", "demo", 1000, SessionConfig::default());
        store.create_session(session).await.unwrap();

        let mut event = Event::new("D1", EventSource::Touch, EventCategory::Interaction, "tap", EventLevel::Info, "tap");
        event.id = "e1".into();
        event.session_id = "s1".into();
        event.timestamp = 1100;
        event.relative_time = 100;
        event.data = Some(serde_json::json!({"x": 10, "y": 20}));
        store.write_event_direct(event).await.unwrap();

        let page = store
            .query_events(EventQuery {
                session_id: Some("s1".into()),
                include_data: true,
                limit: 10,
                ascending: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].data, Some(serde_json::json!({"x": 10, "y": 20})));
    }

    #[tokio::test]
    async fn buffered_write_flushes_on_size_threshold() {
        let (store, _dir) = test_store();
        let session = Session::new("s1", "D1", "manual", "demo", 1000, SessionConfig::default());
        store.create_session(session).await.unwrap();

        for i in 0..3 {
            let mut event = Event::new("D1", EventSource::Log, EventCategory::System, "log", EventLevel::Info, "x");
            event.id = format!("e{i}");
            event.session_id = "s1".into();
            store.write_event(event).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let page = store
            .query_events(EventQuery::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn text_search_matches_title_and_summary() {
        let (store, _dir) = test_store();
        let session = Session::new("s1", "D1", "manual", "demo", 1000, SessionConfig::default());
        store.create_session(session).await.unwrap();

        let mut hit = Event::new("D1", EventSource::Log, EventCategory::System, "log", EventLevel::Info, "network timeout");
        hit.id = "e1".into();
        hit.session_id = "s1".into();
        store.write_event_direct(hit).await.unwrap();

        let mut miss = Event::new("D1", EventSource::Log, EventCategory::System, "log", EventLevel::Info, "login succeeded");
        miss.id = "e2".into();
        miss.session_id = "s1".into();
        store.write_event_direct(miss).await.unwrap();

        let page = store
            .query_events(EventQuery {
                session_id: Some("s1".into()),
                text: Some("timeout".into()),
                limit: 10,
                ascending: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].id, "e1");
    }
}
