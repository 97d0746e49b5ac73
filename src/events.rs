//! The core data model: `Event` and everything it is filed under.
//!
//! `Event` is the one record type every producer emits and every sink
//! consumes. It is not a tagged enum over producer-specific shapes —
//! the device-automation event stream is heterogeneous in content
//! (`data`) but uniform in envelope, so one struct carries it, the way
//! `events(...)` in the schema is one table, not one per source.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generates a process-unique event id: `"{millis}-{seq}"`, monotonic
/// within a process.
pub fn generate_event_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{millis}-{seq}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Log,
    Touch,
    Network,
    Ui,
    System,
    Plugin,
    Assertion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Interaction,
    Diagnostic,
    System,
    Network,
    App,
    Plugin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
            EventLevel::Fatal => "fatal",
        }
    }
}

/// The atom. `EventPipeline` and `EventStore` enforce the ordering and
/// derivation invariants; this type only carries the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    pub device_id: String,
    pub timestamp: i64,
    pub relative_time: i64,
    pub duration: Option<i64>,
    pub source: EventSource,
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub event_type: String,
    pub level: EventLevel,
    pub title: String,
    pub summary: String,
    pub parent_id: Option<String>,
    pub step_id: Option<String>,
    pub trace_id: Option<String>,
    pub parent_event_id: Option<String>,
    pub aggregate_count: Option<u32>,
    pub aggregate_first: Option<i64>,
    pub aggregate_last: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub generated_by_plugin: Option<String>,
    /// Plugin-derivation depth of this event within its chain; not
    /// persisted (the chain is already reconstructible via
    /// `parent_event_id`). Used by the pipeline to enforce the
    /// configured max fan-out depth without re-walking ancestors.
    #[serde(skip, default)]
    pub derivation_depth: u32,
}

impl Event {
    /// A bare event with the minimum fields a producer must set; id,
    /// timestamp and relative_time are filled in by the pipeline at
    /// acceptance time.
    pub fn new(
        device_id: impl Into<String>,
        source: EventSource,
        category: EventCategory,
        event_type: impl Into<String>,
        level: EventLevel,
        title: impl Into<String>,
    ) -> Self {
        Event {
            id: String::new(),
            session_id: String::new(),
            device_id: device_id.into(),
            timestamp: 0,
            relative_time: 0,
            duration: None,
            source,
            category,
            event_type: event_type.into(),
            level,
            title: title.into(),
            summary: String::new(),
            parent_id: None,
            step_id: None,
            trace_id: None,
            parent_event_id: None,
            aggregate_count: None,
            aggregate_first: None,
            aggregate_last: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            data: None,
            generated_by_plugin: None,
            derivation_depth: 0,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The key the pipeline's aggregation window groups on when the
    /// producer did not supply an explicit `dedup_key`.
    pub fn default_dedup_key(&self) -> (EventSource, String, String) {
        (self.source, self.event_type.clone(), self.title.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
    Aborted,
}

/// Which subsystems a session opened; `EndSession` stops exactly these,
/// and only the ones this session itself owns (reference counting on
/// shared resources happens one layer up, in the session coordinator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub log_tailing: bool,
    #[serde(default)]
    pub screen_recording: bool,
    #[serde(default)]
    pub intercepting_proxy: bool,
    #[serde(default)]
    pub device_state_poller: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SessionStatus,
    pub event_count: u64,
    pub video_path: Option<String>,
    pub video_offset: Option<i64>,
    pub video_duration: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub config: SessionConfig,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        session_type: impl Into<String>,
        name: impl Into<String>,
        now: i64,
        config: SessionConfig,
    ) -> Self {
        Session {
            id: id.into(),
            device_id: device_id.into(),
            session_type: session_type.into(),
            name: name.into(),
            start_time: now,
            end_time: 0,
            status: SessionStatus::Active,
            event_count: 0,
            video_path: None,
            video_offset: None,
            video_duration: None,
            metadata: HashMap::new(),
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derived view `(session_id, second) -> event_count, first_event_id, has_error`.
/// Rebuilt from live events on every `GetTimeIndex`; the persisted table
/// is written but never read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeIndexEntry {
    pub second: i64,
    pub event_count: u64,
    pub first_event_id: String,
    pub has_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkType {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub session_id: String,
    pub relative_time: i64,
    pub label: String,
    pub color: String,
    pub bookmark_type: BookmarkType,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Eq,
    Ne,
    Contains,
    Regex,
    Exists,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// `{path, op, value}` against the JSON at `path` inside `Event.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMatcher {
    pub path: String,
    pub op: MatchOp,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Conjunctive event-selection criteria shared by assertions and plugin filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventCriteria {
    #[serde(default)]
    pub source: Vec<EventSource>,
    #[serde(default)]
    pub category: Vec<EventCategory>,
    #[serde(default, rename = "type")]
    pub event_type: Vec<String>,
    #[serde(default)]
    pub level: Vec<EventLevel>,
    #[serde(default)]
    pub relative_time_start: Option<i64>,
    #[serde(default)]
    pub relative_time_end: Option<i64>,
    #[serde(default)]
    pub title_regex: Option<String>,
    #[serde(default)]
    pub data_matchers: Vec<DataMatcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssertionType {
    Exists,
    NotExists,
    Count {
        min_count: Option<u32>,
        max_count: Option<u32>,
        count: Option<u32>,
    },
    Sequence {
        sub_criteria: Vec<EventCriteria>,
    },
    Timing {
        min_interval: i64,
        max_interval: i64,
    },
    Condition {
        op: String, // "<" | "<=" | "=" | ">=" | ">"
        value: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    pub id: String,
    pub name: String,
    pub assertion_type: AssertionType,
    pub criteria: EventCriteria,
    pub expected: Option<Value>,
    pub is_template: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    pub id: String,
    pub assertion_id: String,
    pub session_id: String,
    pub passed: bool,
    pub matched_event_ids: Vec<String>,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
    pub duration_ms: i64,
    pub executed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub filters: EventCriteria,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    pub language: String,
    pub source_code: String,
    pub compiled_code: Option<String>,
    #[serde(default)]
    pub state: HashMap<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchEventType {
    Tap,
    LongPress,
    Swipe,
    Wait,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    Id,
    Text,
    ContentDesc,
    Xpath,
    Coordinates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub selector_type: SelectorType,
    pub value: String,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchScriptEvent {
    /// Milliseconds from script start, gap-compressed.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: TouchEventType,
    pub x: i32,
    pub y: i32,
    pub x2: Option<i32>,
    pub y2: Option<i32>,
    pub duration: Option<i64>,
    pub selector: Option<Selector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchScript {
    pub name: String,
    pub device_model: String,
    /// `"WxH"` of the recording device.
    pub resolution: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub events: Vec<TouchScriptEvent>,
}

impl TouchScript {
    /// Parses `resolution` into `(width, height)`; used by `ScriptPlayer`
    /// to compute per-axis rescale factors.
    pub fn resolution_wh(&self) -> Option<(i32, i32)> {
        let (w, h) = self
            .resolution
            .split_once('x')
            .or_else(|| self.resolution.split_once('X'))?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }

    /// Sanitises `name` to `[A-Za-z0-9_-]` for use as a filename.
    pub fn sanitized_filename(&self) -> String {
        let mut out: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        if out.is_empty() {
            out.push_str("script");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_monotonic_and_unique() {
        let a = generate_event_id();
        let b = generate_event_id();
        assert_ne!(a, b);
    }

    #[test]
    fn touch_script_resolution_parses() {
        let script = TouchScript {
            name: "My Script!!".into(),
            device_model: "Pixel".into(),
            resolution: "1080x2400".into(),
            created_at: chrono::Utc::now(),
            events: vec![],
        };
        assert_eq!(script.resolution_wh(), Some((1080, 2400)));
        assert_eq!(script.sanitized_filename(), "My_Script__");
    }
}
