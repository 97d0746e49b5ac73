//! The closed set of built-in `DerivationPlugin`s this engine ships.
//!
//! Each corresponds to a `Plugin` record whose `id` matches one of the
//! constants below; `Core::load_plugin` looks the id up here rather than
//! compiling `source_code`, since no script engine is available (see
//! `plugins::mod`'s module doc).

use crate::events::{Event, EventCategory, EventCriteria, EventLevel, EventSource};
use crate::error::CoreResult;
use crate::plugins::{DerivationPlugin, PluginApi};
use async_trait::async_trait;

pub const ERROR_COUNTER_ID: &str = "builtin.error_counter";
pub const DOUBLE_TAP_ID: &str = "builtin.double_tap";

/// Counts `error`/`fatal` events and emits a running-total `system`
/// event on every occurrence; state survives restart via `PluginApi`.
pub struct ErrorCounterPlugin {
    filters: EventCriteria,
}

impl Default for ErrorCounterPlugin {
    fn default() -> Self {
        ErrorCounterPlugin {
            filters: EventCriteria {
                level: vec![EventLevel::Error, EventLevel::Fatal],
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl DerivationPlugin for ErrorCounterPlugin {
    fn id(&self) -> &str {
        ERROR_COUNTER_ID
    }

    fn filters(&self) -> &EventCriteria {
        &self.filters
    }

    async fn process(&self, event: &Event, api: &PluginApi) -> CoreResult<Vec<Event>> {
        let count = api
            .state_get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        api.state_set("count", serde_json::json!(count));
        api.log(&format!("error count now {count}"));

        let mut derived = Event::new(
            event.device_id.clone(),
            EventSource::Plugin,
            EventCategory::System,
            "error_tick",
            EventLevel::Info,
            format!("{count} error(s) observed this session"),
        );
        derived.session_id = event.session_id.clone();
        derived.data = Some(serde_json::json!({"count": count, "source_event_id": event.id}));
        Ok(vec![derived])
    }
}

/// Flags a `double_tap` derived event when two taps land on the same
/// device within 300 ms of each other.
pub struct DoubleTapPlugin {
    filters: EventCriteria,
}

impl Default for DoubleTapPlugin {
    fn default() -> Self {
        DoubleTapPlugin {
            filters: EventCriteria {
                source: vec![EventSource::Touch],
                event_type: vec!["tap".to_string()],
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl DerivationPlugin for DoubleTapPlugin {
    fn id(&self) -> &str {
        DOUBLE_TAP_ID
    }

    fn filters(&self) -> &EventCriteria {
        &self.filters
    }

    async fn process(&self, event: &Event, api: &PluginApi) -> CoreResult<Vec<Event>> {
        let last_ts = api.state_get("last_tap_ts").and_then(|v| v.as_i64());
        api.state_set("last_tap_ts", serde_json::json!(event.timestamp));

        let Some(last_ts) = last_ts else {
            return Ok(vec![]);
        };
        if event.timestamp - last_ts > 300 {
            return Ok(vec![]);
        }

        let mut derived = Event::new(
            event.device_id.clone(),
            EventSource::Plugin,
            EventCategory::Interaction,
            "double_tap",
            EventLevel::Info,
            "double tap detected",
        );
        derived.session_id = event.session_id.clone();
        Ok(vec![derived])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_counter_increments_across_calls() {
        use crate::store::{EventStore, StoreConfig};
        use std::collections::HashMap;
        use std::sync::{Arc, Mutex};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            EventStore::open(StoreConfig { db_path: dir.path().join("e.db"), ..Default::default() }).unwrap(),
        );
        let state = Arc::new(Mutex::new(HashMap::new()));
        let api = PluginApi::new(ERROR_COUNTER_ID.to_string(), state, store, 8);

        let plugin = ErrorCounterPlugin::default();
        let event = Event::new("D1", EventSource::Log, EventCategory::Diagnostic, "crash", EventLevel::Error, "crash");
        let derived = plugin.process(&event, &api).await.unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].data.as_ref().unwrap()["count"], 1);

        let derived2 = plugin.process(&event, &api).await.unwrap();
        assert_eq!(derived2[0].data.as_ref().unwrap()["count"], 2);
    }
}
