//! The scoped `api` a plugin invocation receives: logging, persistent
//! `state` get/set coalesced and flushed asynchronously, and implicit
//! parent/generated-by stamping (done by the caller, not here).

use crate::store::EventStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct PluginApi {
    plugin_id: String,
    state: Arc<Mutex<HashMap<String, Value>>>,
    store: Arc<EventStore>,
    dirty: AtomicBool,
    captured_logs: Option<Arc<Mutex<Vec<String>>>>,
    #[allow(dead_code)]
    max_derived: usize,
}

impl PluginApi {
    pub fn new(
        plugin_id: String,
        state: Arc<Mutex<HashMap<String, Value>>>,
        store: Arc<EventStore>,
        max_derived: usize,
    ) -> Self {
        PluginApi {
            plugin_id,
            state,
            store,
            dirty: AtomicBool::new(false),
            captured_logs: None,
            max_derived,
        }
    }

    /// Same as `new`, but `log` calls are additionally captured for
    /// later retrieval — used by the test harness to preview plugin
    /// output without relying on the global tracing subscriber.
    pub fn with_log_capture(
        plugin_id: String,
        state: Arc<Mutex<HashMap<String, Value>>>,
        store: Arc<EventStore>,
        max_derived: usize,
        captured_logs: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        PluginApi {
            plugin_id,
            state,
            store,
            dirty: AtomicBool::new(false),
            captured_logs: Some(captured_logs),
            max_derived,
        }
    }

    pub fn log(&self, message: &str) {
        info!(target: "plugin", plugin = %self.plugin_id, "{message}");
        if let Some(logs) = &self.captured_logs {
            logs.lock().unwrap().push(message.to_string());
        }
    }

    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn state_set(&self, key: &str, value: Value) {
        self.state.lock().unwrap().insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Coalesced flush: a no-op unless `state_set` was called during
    /// this invocation. Called once at the end of every successful
    /// invocation, which is what makes state durable across a restart —
    /// the next `load` reseeds from whatever was last persisted here.
    pub async fn flush_state(&self) {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }
        let snapshot = serde_json::to_value(&*self.state.lock().unwrap()).unwrap_or_default();
        if let Err(e) = self.store.upsert_plugin_state(self.plugin_id.clone(), snapshot).await {
            warn!(plugin = %self.plugin_id, error = %e, "failed to persist plugin state");
        }
    }
}
