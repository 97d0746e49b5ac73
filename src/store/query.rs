//! `QueryEvents` — dynamic query construction over the `events` table.
//!
//! Two shapes: "list mode" (no payload, catalogue
//! browsing) and "detail mode" (joined with `event_data`, used when
//! `include_data` is requested or free-text search needs payload
//! content). `DISTINCT` is required in detail mode because the join
//! against `event_data` would otherwise duplicate rows whenever a
//! payload happens to be absent and the join falls back to a left join
//! producing one row regardless — kept defensive rather than relying on
//! the 1:1 cardinality always holding.

use super::codec;
use super::schema;
use crate::error::CoreResult;
use crate::events::{Event, EventCategory, EventLevel, EventSource};
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub source: Vec<EventSource>,
    pub category: Vec<EventCategory>,
    pub event_type: Vec<String>,
    pub level: Vec<EventLevel>,
    pub relative_time_start: Option<i64>,
    pub relative_time_end: Option<i64>,
    pub parent_id: Option<String>,
    pub step_id: Option<String>,
    pub trace_id: Option<String>,
    pub text: Option<String>,
    pub include_data: bool,
    pub limit: i64,
    pub offset: i64,
    pub ascending: bool,
}

impl EventQuery {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        EventQuery {
            session_id: Some(session_id.into()),
            limit: 100,
            ascending: true,
            ..Default::default()
        }
    }
}

pub struct QueryPage {
    pub events: Vec<Event>,
    pub total: i64,
    pub has_more: bool,
}

fn source_str(s: EventSource) -> &'static str {
    match s {
        EventSource::Log => "log",
        EventSource::Touch => "touch",
        EventSource::Network => "network",
        EventSource::Ui => "ui",
        EventSource::System => "system",
        EventSource::Plugin => "plugin",
        EventSource::Assertion => "assertion",
    }
}

fn category_str(c: EventCategory) -> &'static str {
    match c {
        EventCategory::Interaction => "interaction",
        EventCategory::Diagnostic => "diagnostic",
        EventCategory::System => "system",
        EventCategory::Network => "network",
        EventCategory::App => "app",
        EventCategory::Plugin => "plugin",
    }
}

fn level_str(l: EventLevel) -> &'static str {
    l.as_str()
}

/// Builds the `WHERE` clause and bound parameters shared by the count
/// query and the page query. `use_fts` routes title/summary matching
/// through the `events_fts` virtual table (`MATCH`) instead of `LIKE`;
/// payload content is never indexed by FTS, so it always falls back to
/// a substring scan regardless.
fn build_predicate(q: &EventQuery, needs_text_in_payload: bool, use_fts: bool) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if let Some(sid) = &q.session_id {
        clauses.push("e.session_id = ?".to_string());
        params.push(sid.clone());
    }
    if let Some(did) = &q.device_id {
        clauses.push("e.device_id = ?".to_string());
        params.push(did.clone());
    }
    if !q.source.is_empty() {
        let placeholders = vec!["?"; q.source.len()].join(",");
        clauses.push(format!("e.source IN ({placeholders})"));
        params.extend(q.source.iter().map(|s| source_str(*s).to_string()));
    }
    if !q.category.is_empty() {
        let placeholders = vec!["?"; q.category.len()].join(",");
        clauses.push(format!("e.category IN ({placeholders})"));
        params.extend(q.category.iter().map(|c| category_str(*c).to_string()));
    }
    if !q.event_type.is_empty() {
        let placeholders = vec!["?"; q.event_type.len()].join(",");
        clauses.push(format!("e.type IN ({placeholders})"));
        params.extend(q.event_type.iter().cloned());
    }
    if !q.level.is_empty() {
        let placeholders = vec!["?"; q.level.len()].join(",");
        clauses.push(format!("e.level IN ({placeholders})"));
        params.extend(q.level.iter().map(|l| level_str(*l).to_string()));
    }
    if let Some(start) = q.relative_time_start {
        clauses.push("e.relative_time >= ?".to_string());
        params.push(start.to_string());
    }
    if let Some(end) = q.relative_time_end {
        clauses.push("e.relative_time <= ?".to_string());
        params.push(end.to_string());
    }
    if let Some(p) = &q.parent_id {
        clauses.push("e.parent_id = ?".to_string());
        params.push(p.clone());
    }
    if let Some(s) = &q.step_id {
        clauses.push("e.step_id = ?".to_string());
        params.push(s.clone());
    }
    if let Some(t) = &q.trace_id {
        clauses.push("e.trace_id = ?".to_string());
        params.push(t.clone());
    }
    if let Some(text) = &q.text {
        if use_fts {
            // Quoted phrase query keeps FTS5 operator characters in `text`
            // (like `-` or `*`) from being parsed as query syntax.
            let fts_query = format!("\"{}\"", text.replace('"', "\"\""));
            if needs_text_in_payload {
                clauses.push(
                    "(e.rowid IN (SELECT rowid FROM events_fts WHERE events_fts MATCH ?) OR CAST(d.data AS TEXT) LIKE ?)"
                        .to_string(),
                );
                params.push(fts_query);
                params.push(format!("%{text}%"));
            } else {
                clauses.push("e.rowid IN (SELECT rowid FROM events_fts WHERE events_fts MATCH ?)".to_string());
                params.push(fts_query);
            }
        } else if needs_text_in_payload {
            clauses.push(
                "(e.title LIKE ? OR e.summary LIKE ? OR CAST(d.data AS TEXT) LIKE ?)".to_string(),
            );
            let pat = format!("%{text}%");
            params.push(pat.clone());
            params.push(pat.clone());
            params.push(pat);
        } else {
            clauses.push("(e.title LIKE ? OR e.summary LIKE ?)".to_string());
            let pat = format!("%{text}%");
            params.push(pat.clone());
            params.push(pat);
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_sql, params)
}

pub fn query_events(conn: &Connection, q: &EventQuery) -> CoreResult<QueryPage> {
    // Free-text search against payload content forces detail mode even
    // if the caller didn't ask for `include_data`.
    let detail_mode = q.include_data || q.text.is_some();
    let use_fts = q.text.is_some() && fts_supported(conn);
    let (where_sql, params) = build_predicate(q, detail_mode, use_fts);

    let count_sql = if detail_mode {
        format!(
            "SELECT COUNT(DISTINCT e.id) FROM events e LEFT JOIN event_data d ON d.event_id = e.id {where_sql}"
        )
    } else {
        format!("SELECT COUNT(*) FROM events e {where_sql}")
    };
    let total: i64 = conn.query_row(&count_sql, params_from_iter(params.iter()), |row| row.get(0))?;

    let order = if q.ascending { "ASC" } else { "DESC" };
    let limit = q.limit.max(1);
    let offset = q.offset.max(0);

    let page_sql = if detail_mode {
        format!(
            "SELECT DISTINCT e.id, e.session_id, e.device_id, e.timestamp, e.relative_time, e.duration,
                    e.source, e.category, e.type, e.level, e.title, e.summary, e.parent_id, e.step_id,
                    e.trace_id, e.aggregate_count, e.aggregate_first, e.aggregate_last, e.tags, e.metadata,
                    e.parent_event_id, e.generated_by_plugin, d.data
             FROM events e LEFT JOIN event_data d ON d.event_id = e.id
             {where_sql}
             ORDER BY e.relative_time {order}, e.id {order}
             LIMIT ? OFFSET ?"
        )
    } else {
        format!(
            "SELECT e.id, e.session_id, e.device_id, e.timestamp, e.relative_time, e.duration,
                    e.source, e.category, e.type, e.level, e.title, e.summary, e.parent_id, e.step_id,
                    e.trace_id, e.aggregate_count, e.aggregate_first, e.aggregate_last, e.tags, e.metadata,
                    e.parent_event_id, e.generated_by_plugin, NULL
             FROM events e
             {where_sql}
             ORDER BY e.relative_time {order}, e.id {order}
             LIMIT ? OFFSET ?"
        )
    };

    let mut stmt = conn.prepare(&page_sql)?;
    let mut all_params: Vec<String> = params;
    all_params.push(limit.to_string());
    all_params.push(offset.to_string());

    let rows = stmt.query_map(params_from_iter(all_params.iter()), row_to_event)?;
    let mut events = Vec::new();
    for r in rows {
        events.push(r?);
    }
    let has_more = offset + events.len() as i64 < total;
    Ok(QueryPage { events, total, has_more })
}

pub fn get_event(conn: &Connection, id: &str) -> CoreResult<Option<Event>> {
    let sql = "SELECT e.id, e.session_id, e.device_id, e.timestamp, e.relative_time, e.duration,
                      e.source, e.category, e.type, e.level, e.title, e.summary, e.parent_id, e.step_id,
                      e.trace_id, e.aggregate_count, e.aggregate_first, e.aggregate_last, e.tags, e.metadata,
                      e.parent_event_id, e.generated_by_plugin, d.data
               FROM events e LEFT JOIN event_data d ON d.event_id = e.id
               WHERE e.id = ?";
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query_map([id], row_to_event)?;
    match rows.next() {
        Some(r) => Ok(Some(r?)),
        None => Ok(None),
    }
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let source: String = row.get(6)?;
    let category: String = row.get(7)?;
    let level: String = row.get(9)?;
    let tags_json: String = row.get(18)?;
    let metadata_json: String = row.get(19)?;
    let data_blob: Option<Vec<u8>> = row.get(22)?;

    let data: Option<Value> = data_blob.and_then(|raw| {
        let inflated = codec::decode_payload(&raw);
        serde_json::from_slice(&inflated).ok()
    });

    Ok(Event {
        id: row.get(0)?,
        session_id: row.get(1)?,
        device_id: row.get(2)?,
        timestamp: row.get(3)?,
        relative_time: row.get(4)?,
        duration: row.get(5)?,
        source: parse_source(&source),
        category: parse_category(&category),
        event_type: row.get(8)?,
        level: parse_level(&level),
        title: row.get(10)?,
        summary: row.get(11)?,
        parent_id: row.get(12)?,
        step_id: row.get(13)?,
        trace_id: row.get(14)?,
        aggregate_count: row.get(15)?,
        aggregate_first: row.get(16)?,
        aggregate_last: row.get(17)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        parent_event_id: row.get(20)?,
        generated_by_plugin: row.get(21)?,
        data,
    })
}

fn parse_source(s: &str) -> EventSource {
    match s {
        "touch" => EventSource::Touch,
        "network" => EventSource::Network,
        "ui" => EventSource::Ui,
        "system" => EventSource::System,
        "plugin" => EventSource::Plugin,
        "assertion" => EventSource::Assertion,
        _ => EventSource::Log,
    }
}

fn parse_category(c: &str) -> EventCategory {
    match c {
        "diagnostic" => EventCategory::Diagnostic,
        "system" => EventCategory::System,
        "network" => EventCategory::Network,
        "app" => EventCategory::App,
        "plugin" => EventCategory::Plugin,
        _ => EventCategory::Interaction,
    }
}

fn parse_level(l: &str) -> EventLevel {
    match l {
        "debug" => EventLevel::Debug,
        "warn" => EventLevel::Warn,
        "error" => EventLevel::Error,
        "fatal" => EventLevel::Fatal,
        _ => EventLevel::Info,
    }
}

pub fn source_as_str(s: EventSource) -> &'static str {
    source_str(s)
}
pub fn category_as_str(c: EventCategory) -> &'static str {
    category_str(c)
}
pub fn level_as_str(l: EventLevel) -> &'static str {
    level_str(l)
}

/// Whether the `events_fts` virtual table is present; `query_events`
/// uses this to decide between `MATCH` and `LIKE` for text search.
pub fn fts_supported(conn: &Connection) -> bool {
    schema::fts_available(conn)
}
