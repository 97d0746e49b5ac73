//! `PluginManager`: runs derivation plugins over each primary event.
//!
//! No embeddable script engine (JS or otherwise) is in play here, so
//! plugins are a closed set of built-in `DerivationPlugin` trait
//! objects, dispatched by id, generalized to the
//! `process(event, state, api) -> derived_events[]` shape. The on-disk
//! `Plugin` record still carries `language` for format fidelity;
//! `"native"` is the only language this engine loads, anything else is
//! rejected at load time (see `load`).

mod api;
pub mod builtin;
mod harness;

pub use api::PluginApi;
pub use harness::{TestPlugin, TestPluginOutcome};

use crate::assertions::criteria_matches;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventCategory, EventLevel, EventSource, Plugin};
use crate::pipeline::EventPipeline;
use crate::store::EventStore;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// A built-in derivation: `filters` decides eligibility, `process`
/// computes derived events against a scoped `PluginApi`.
#[async_trait]
pub trait DerivationPlugin: Send + Sync {
    fn id(&self) -> &str;
    fn filters(&self) -> &crate::events::EventCriteria;
    async fn process(&self, event: &Event, api: &PluginApi) -> CoreResult<Vec<Event>>;
}

#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    pub event_budget: Duration,
    pub max_derived_per_primary: usize,
    pub max_depth: u32,
    pub strike_window: Duration,
    pub strikes_to_disable: u32,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        PluginManagerConfig {
            event_budget: Duration::from_millis(200),
            max_derived_per_primary: 8,
            max_depth: 3,
            strike_window: Duration::from_secs(60),
            strikes_to_disable: 3,
        }
    }
}

struct PluginSlot {
    plugin: Arc<dyn DerivationPlugin>,
    enabled: Arc<AtomicBool>,
    strikes: Mutex<VecDeque<Instant>>,
    state: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

pub struct PluginManager {
    config: PluginManagerConfig,
    store: Arc<EventStore>,
    slots: Mutex<Vec<PluginSlot>>,
    pipeline: Mutex<Option<Arc<EventPipeline>>>,
}

impl PluginManager {
    pub fn new(config: PluginManagerConfig, store: Arc<EventStore>) -> Self {
        PluginManager {
            config,
            store,
            slots: Mutex::new(Vec::new()),
            pipeline: Mutex::new(None),
        }
    }

    /// Wires the pipeline handle plugin-invocation failures are reported
    /// into. Constructed after `PluginManager` itself (the pipeline's
    /// fan-out needs a `PluginManagerSink` wrapping this manager), so
    /// this is a second step rather than a constructor argument.
    pub fn attach_pipeline(&self, pipeline: Arc<EventPipeline>) {
        *self.pipeline.lock().unwrap() = Some(pipeline);
    }

    /// Validates and registers a `Plugin` record. Rejects anything
    /// whose declared language isn't `"native"` rather than silently
    /// ignoring it, since a script-backed plugin would otherwise
    /// appear to be loaded while never actually running.
    ///
    /// State is seeded from the `plugin_state` table when a prior run
    /// persisted one, falling back to `record.state` for a first load —
    /// this is what makes plugin state survive a restart.
    pub async fn load(&self, record: &Plugin, plugin: Arc<dyn DerivationPlugin>) -> CoreResult<()> {
        if record.language != "native" {
            return Err(CoreError::validation(format!(
                "plugin '{}' declares unsupported language '{}' (only 'native' derivation plugins are executable)",
                record.name, record.language
            )));
        }
        if !record.enabled {
            return Ok(());
        }
        let initial_state = match self.store.get_plugin_state(record.id.clone()).await? {
            Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => record.state.clone(),
        };
        let slot = PluginSlot {
            plugin,
            enabled: Arc::new(AtomicBool::new(true)),
            strikes: Mutex::new(VecDeque::new()),
            state: Arc::new(Mutex::new(initial_state)),
        };
        self.slots.lock().unwrap().push(slot);
        Ok(())
    }

    /// Invokes every matching, enabled plugin for `event` under a
    /// single-threaded per-plugin scheduler (sequential here: a plugin
    /// instance never sees two events concurrently because we hold its
    /// slot for the duration of its call).
    pub async fn on_event(&self, event: &Event) -> Vec<Event> {
        let candidates: Vec<usize> = {
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.enabled.load(Ordering::Relaxed) && criteria_matches(event, s.plugin.filters(), None))
                .map(|(i, _)| i)
                .collect()
        };

        let mut derived = Vec::new();
        for idx in candidates {
            derived.extend(self.invoke_slot(idx, event).await);
        }
        derived
    }

    async fn invoke_slot(&self, idx: usize, event: &Event) -> Vec<Event> {
        let (plugin, enabled, state) = {
            let slots = self.slots.lock().unwrap();
            let slot = &slots[idx];
            (slot.plugin.clone(), slot.enabled.clone(), slot.state.clone())
        };

        let api = PluginApi::new(
            plugin.id().to_string(),
            state.clone(),
            self.store.clone(),
            self.config.max_derived_per_primary,
        );
        let call = plugin.process(event, &api);

        match tokio::time::timeout(self.config.event_budget, call).await {
            Ok(Ok(mut derived)) => {
                if derived.len() > self.config.max_derived_per_primary {
                    warn!(plugin = plugin.id(), "plugin exceeded derived-event budget, truncating");
                    derived.truncate(self.config.max_derived_per_primary);
                }
                for e in &mut derived {
                    e.generated_by_plugin = Some(plugin.id().to_string());
                }
                api.flush_state().await;
                derived
            }
            Ok(Err(e)) => {
                error!(plugin = plugin.id(), error = %e, "plugin invocation failed");
                self.strike(idx, &enabled);
                self.emit_plugin_error(event, plugin.id(), &e).await;
                Vec::new()
            }
            Err(_) => {
                let e = CoreError::overload(format!(
                    "plugin '{}' exceeded its {:?} time budget",
                    plugin.id(),
                    self.config.event_budget
                ));
                error!(plugin = plugin.id(), "plugin invocation exceeded time budget");
                self.strike(idx, &enabled);
                self.emit_plugin_error(event, plugin.id(), &e).await;
                Vec::new()
            }
        }
    }

    /// Surfaces a plugin budget/failure as an error-level event on the
    /// pipeline, gated by `CoreError::is_warn_or_above` so a plain
    /// `NotFound`-style miss never gets promoted into the event stream.
    /// A no-op before the pipeline handle is attached.
    async fn emit_plugin_error(&self, source_event: &Event, plugin_id: &str, err: &CoreError) {
        if !err.is_warn_or_above() {
            return;
        }
        let pipeline = self.pipeline.lock().unwrap().clone();
        let Some(pipeline) = pipeline else { return };

        let mut error_event = Event::new(
            source_event.device_id.clone(),
            EventSource::Plugin,
            EventCategory::Plugin,
            "plugin_error",
            EventLevel::Error,
            format!("plugin '{plugin_id}' failed: {}", err.message()),
        );
        error_event.session_id = source_event.session_id.clone();
        error_event.generated_by_plugin = Some(plugin_id.to_string());

        if let Err(e) = pipeline.emit(error_event).await {
            warn!(plugin = plugin_id, error = %e, "failed to emit plugin error event");
        }
    }

    /// Enables or disables an already-loaded plugin by id; `NotFound` if
    /// no slot was ever loaded for that id.
    pub fn set_enabled(&self, plugin_id: &str, enabled: bool) -> CoreResult<()> {
        let slots = self.slots.lock().unwrap();
        let slot = slots
            .iter()
            .find(|s| s.plugin.id() == plugin_id)
            .ok_or_else(|| CoreError::not_found(format!("plugin {plugin_id} not loaded")))?;
        slot.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Drops a loaded plugin's slot entirely; idempotent.
    pub fn unload(&self, plugin_id: &str) {
        self.slots.lock().unwrap().retain(|s| s.plugin.id() != plugin_id);
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.slots.lock().unwrap().iter().any(|s| s.plugin.id() == plugin_id)
    }

    /// Three strikes within the configured window auto-disables the plugin.
    fn strike(&self, idx: usize, enabled: &Arc<AtomicBool>) {
        let slots = self.slots.lock().unwrap();
        let slot = &slots[idx];
        let mut strikes = slot.strikes.lock().unwrap();
        let now = Instant::now();
        strikes.push_back(now);
        while let Some(front) = strikes.front() {
            if now.duration_since(*front) > self.config.strike_window {
                strikes.pop_front();
            } else {
                break;
            }
        }
        if strikes.len() as u32 >= self.config.strikes_to_disable {
            enabled.store(false, Ordering::Relaxed);
            warn!(plugin = slot.plugin.id(), "plugin auto-disabled after repeated strikes");
        }
    }
}

/// Pipeline-facing sink adapter so `PluginManager` can be registered
/// directly as the pipeline's fan-out position (6).
pub struct PluginManagerSink(pub Arc<PluginManager>);

#[async_trait]
impl crate::pipeline::EventSink for PluginManagerSink {
    fn name(&self) -> &str {
        "plugin_manager"
    }

    async fn accept(&self, event: &Event) -> CoreResult<Vec<Event>> {
        Ok(self.0.on_event(event).await)
    }
}
