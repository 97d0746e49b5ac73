//! `TestPlugin`: exercises a `DerivationPlugin` against stored or synthetic
//! events without touching the store, for preview/debugging a plugin
//! before it runs live.

use crate::assertions::criteria_matches;
use crate::events::Event;
use crate::plugins::{DerivationPlugin, PluginApi};
use crate::store::query::EventQuery;
use crate::store::EventStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct TestPluginOutcome {
    pub event_id: String,
    pub filter_matched: bool,
    pub invoked: bool,
    pub derived: Vec<Event>,
    pub logs: Vec<String>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Drives a plugin against a chosen set of events and reports per-event
/// results without writing anything to the store or the pipeline.
pub struct TestPlugin {
    store: Arc<EventStore>,
}

impl TestPlugin {
    pub fn new(store: Arc<EventStore>) -> Self {
        TestPlugin { store }
    }

    /// Runs against up to `limit` events already stored for `session_id`.
    pub async fn run_against_session(
        &self,
        plugin: &dyn DerivationPlugin,
        session_id: &str,
        limit: i64,
    ) -> crate::error::CoreResult<Vec<TestPluginOutcome>> {
        let mut query = EventQuery::for_session(session_id);
        query.limit = limit;
        query.include_data = true;
        let page = self.store.query_events(query).await?;
        let mut outcomes = Vec::with_capacity(page.events.len());
        for event in &page.events {
            outcomes.push(self.run_one(plugin, event).await);
        }
        Ok(outcomes)
    }

    /// Runs against a single synthetic event supplied directly by the caller.
    pub async fn run_against_event(&self, plugin: &dyn DerivationPlugin, event: &Event) -> TestPluginOutcome {
        self.run_one(plugin, event).await
    }

    async fn run_one(&self, plugin: &dyn DerivationPlugin, event: &Event) -> TestPluginOutcome {
        let filter_matched = criteria_matches(event, plugin.filters(), None);
        if !filter_matched {
            return TestPluginOutcome {
                event_id: event.id.clone(),
                filter_matched: false,
                invoked: false,
                derived: Vec::new(),
                logs: Vec::new(),
                elapsed_ms: 0,
                error: None,
            };
        }

        let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new(HashMap::new()));
        let api = PluginApi::with_log_capture(plugin.id().to_string(), state, self.store.clone(), 64, logs.clone());
        let start = Instant::now();
        let result = plugin.process(event, &api).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(derived) => TestPluginOutcome {
                event_id: event.id.clone(),
                filter_matched: true,
                invoked: true,
                derived,
                logs: logs.lock().unwrap().clone(),
                elapsed_ms,
                error: None,
            },
            Err(e) => TestPluginOutcome {
                event_id: event.id.clone(),
                filter_matched: true,
                invoked: true,
                derived: Vec::new(),
                logs: logs.lock().unwrap().clone(),
                elapsed_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCategory, EventCriteria, EventLevel, EventSource};
    use crate::store::StoreConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoPlugin {
        filters: EventCriteria,
    }

    #[async_trait]
    impl DerivationPlugin for EchoPlugin {
        fn id(&self) -> &str {
            "echo"
        }

        fn filters(&self) -> &EventCriteria {
            &self.filters
        }

        async fn process(&self, event: &Event, api: &PluginApi) -> crate::error::CoreResult<Vec<Event>> {
            api.log("echoing event");
            let mut derived = event.clone();
            derived.title = format!("echo:{}", event.title);
            Ok(vec![derived])
        }
    }

    fn test_store() -> (Arc<EventStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(StoreConfig {
            db_path: dir.path().join("harness.db"),
            flush_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn synthetic_event_runs_and_captures_logs() {
        let (store, _dir) = test_store();
        let plugin = EchoPlugin { filters: EventCriteria::default() };
        let harness = TestPlugin::new(store);
        let event = Event::new("D1", EventSource::Log, EventCategory::System, "boot", EventLevel::Info, "hello");

        let outcome = harness.run_against_event(&plugin, &event).await;
        assert!(outcome.filter_matched);
        assert!(outcome.invoked);
        assert_eq!(outcome.derived.len(), 1);
        assert_eq!(outcome.derived[0].title, "echo:hello");
        assert_eq!(outcome.logs, vec!["echoing event".to_string()]);
    }

    #[tokio::test]
    async fn non_matching_filter_skips_invocation() {
        let (store, _dir) = test_store();
        let mut filters = EventCriteria::default();
        filters.source = vec![EventSource::Network];
        let plugin = EchoPlugin { filters };
        let harness = TestPlugin::new(store);
        let event = Event::new("D1", EventSource::Log, EventCategory::System, "boot", EventLevel::Info, "hello");

        let outcome = harness.run_against_event(&plugin, &event).await;
        assert!(!outcome.filter_matched);
        assert!(!outcome.invoked);
        assert!(outcome.derived.is_empty());
    }
}
