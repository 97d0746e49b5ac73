//! `CoreApi`: the complete, documented control-surface contract a GUI or
//! machine-control frontend would call through. Not wired to any
//! transport — those frontends are out of scope — but every operation
//! the control surface promises is implemented here against the real
//! subsystems (store, pipeline, assertions, plugins, touch, ui).

use crate::assertions::AssertionEngine;
use crate::bridge::DeviceBridge;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::events::{
    Assertion, AssertionResult, Bookmark, Event, Plugin, Session, SessionConfig, SessionStatus, TouchScript,
};
use crate::pipeline::{EventPipeline, SessionManager};
use crate::plugins::{builtin, DerivationPlugin, PluginManager, TestPlugin, TestPluginOutcome};
use crate::store::query::{EventQuery, QueryPage};
use crate::store::EventStore;
use crate::touch::{FirstCandidate, PlaybackHandle, RecordMode, RecorderHandle, ScriptPlayer, TouchRecorder};
use crate::ui::{self, UiNode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One method per control-surface operation listed for frontends:
/// session CRUD, event query, bookmark CRUD, assertion CRUD+execute,
/// plugin CRUD/enable-disable/test, touch recording start/stop/pause/
/// resume, script save/load/list/rename/delete/play/stop/pause/resume,
/// UI dump and search.
#[async_trait]
pub trait CoreApi: Send + Sync {
    async fn start_session(
        &self,
        device_id: String,
        session_type: String,
        name: String,
        config: SessionConfig,
    ) -> CoreResult<Session>;
    async fn end_session(&self, session_id: String) -> CoreResult<Session>;
    async fn get_session(&self, session_id: String) -> CoreResult<Option<Session>>;
    async fn list_sessions(&self, device_id: Option<String>, limit: i64) -> CoreResult<Vec<Session>>;

    async fn query_events(&self, query: EventQuery) -> CoreResult<QueryPage>;
    async fn get_event(&self, event_id: String) -> CoreResult<Option<Event>>;

    async fn create_bookmark(&self, bookmark: Bookmark) -> CoreResult<()>;
    async fn delete_bookmark(&self, id: String) -> CoreResult<()>;
    async fn list_bookmarks(&self, session_id: String) -> CoreResult<Vec<Bookmark>>;

    async fn upsert_assertion(&self, assertion: Assertion) -> CoreResult<()>;
    async fn delete_assertion(&self, id: String) -> CoreResult<()>;
    async fn list_assertions(&self) -> CoreResult<Vec<Assertion>>;
    async fn execute_assertion(&self, assertion_id: String, session_id: String) -> CoreResult<AssertionResult>;

    async fn create_plugin(&self, plugin: Plugin) -> CoreResult<()>;
    async fn update_plugin(&self, plugin: Plugin) -> CoreResult<()>;
    async fn delete_plugin(&self, id: String) -> CoreResult<()>;
    async fn get_plugin(&self, id: String) -> CoreResult<Option<Plugin>>;
    async fn list_plugins(&self) -> CoreResult<Vec<Plugin>>;
    async fn set_plugin_enabled(&self, id: String, enabled: bool) -> CoreResult<()>;
    async fn test_plugin(&self, id: String, session_id: String, limit: i64) -> CoreResult<Vec<TestPluginOutcome>>;

    async fn start_recording(
        &self,
        device_id: String,
        session_id: String,
        mode: RecordMode,
        script_name: String,
        device_model: String,
        screen_w: i32,
        screen_h: i32,
    ) -> CoreResult<()>;
    async fn stop_recording(&self, device_id: String) -> CoreResult<TouchScript>;
    async fn pause_recording(&self, device_id: String) -> CoreResult<()>;
    async fn resume_recording(&self, device_id: String) -> CoreResult<()>;

    async fn save_script(&self, script: TouchScript) -> CoreResult<()>;
    async fn load_script(&self, name: String) -> CoreResult<TouchScript>;
    async fn list_scripts(&self) -> CoreResult<Vec<String>>;
    async fn rename_script(&self, old_name: String, new_name: String) -> CoreResult<()>;
    async fn delete_script(&self, name: String) -> CoreResult<()>;

    async fn play_script(&self, name: String, device_id: String, target_w: i32, target_h: i32) -> CoreResult<()>;
    async fn stop_playback(&self, device_id: String) -> CoreResult<()>;
    async fn pause_playback(&self, device_id: String) -> CoreResult<()>;
    async fn resume_playback(&self, device_id: String) -> CoreResult<()>;

    async fn dump_ui(&self, device_id: String) -> CoreResult<Vec<UiNode>>;
    async fn search_ui(&self, device_id: String, expression: String) -> CoreResult<Vec<UiNode>>;
}

/// The concrete wiring: one process-wide instance owns the store,
/// pipeline, session map, assertion engine, plugin manager, and the
/// per-device recorder/playback handles the touch subsystem hands out.
pub struct Core {
    config: Config,
    bridge: Arc<dyn DeviceBridge>,
    store: Arc<EventStore>,
    pipeline: Arc<EventPipeline>,
    sessions: Arc<SessionManager>,
    assertions: AssertionEngine,
    plugins: Arc<PluginManager>,
    recorder: TouchRecorder,
    player: ScriptPlayer,
    active_recordings: Mutex<HashMap<String, RecorderHandle>>,
    active_playbacks: Mutex<HashMap<String, PlaybackHandle>>,
}

impl Core {
    pub fn new(
        config: Config,
        bridge: Arc<dyn DeviceBridge>,
        store: Arc<EventStore>,
        pipeline: Arc<EventPipeline>,
        sessions: Arc<SessionManager>,
        plugins: Arc<PluginManager>,
    ) -> Self {
        let assertions = AssertionEngine::new(store.clone(), pipeline.clone());
        let recorder = TouchRecorder::new(bridge.clone(), pipeline.clone(), config.touch.clone());
        let player = ScriptPlayer::new(bridge.clone(), config.touch.clone(), config.ui.clone());
        Core {
            config,
            bridge,
            store,
            pipeline,
            sessions,
            assertions,
            plugins,
            recorder,
            player,
            active_recordings: Mutex::new(HashMap::new()),
            active_playbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the built-in `DerivationPlugin` a `Plugin` record's id
    /// maps to; only the engine's closed set is executable (see
    /// `plugins::builtin`).
    fn resolve_builtin(id: &str) -> Option<Arc<dyn DerivationPlugin>> {
        match id {
            builtin::ERROR_COUNTER_ID => Some(Arc::new(builtin::ErrorCounterPlugin::default())),
            builtin::DOUBLE_TAP_ID => Some(Arc::new(builtin::DoubleTapPlugin::default())),
            _ => None,
        }
    }

    fn plugin_path(&self, id: &str) -> std::path::PathBuf {
        self.config.plugins_dir().join(format!("{id}.json"))
    }

    fn script_path(&self, name: &str) -> std::path::PathBuf {
        let safe: String = name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' }).collect();
        self.config.scripts_dir().join(format!("{safe}.json"))
    }

    async fn read_plugin_record(&self, id: &str) -> CoreResult<Option<Plugin>> {
        let path = self.plugin_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let plugin = serde_json::from_str(&contents)
                    .map_err(|e| CoreError::validation(format!("corrupt plugin file {}: {e}", path.display())))?;
                Ok(Some(plugin))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::transient(format!("failed to read plugin file: {e}"), 1)),
        }
    }

    async fn write_plugin_record(&self, plugin: &Plugin) -> CoreResult<()> {
        let dir = self.config.plugins_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::transient(format!("failed to create plugins dir: {e}"), 1))?;
        let json = serde_json::to_string_pretty(plugin)
            .map_err(|e| CoreError::validation(format!("failed to serialize plugin: {e}")))?;
        tokio::fs::write(self.plugin_path(&plugin.id), json)
            .await
            .map_err(|e| CoreError::transient(format!("failed to write plugin file: {e}"), 1))
    }
}

#[async_trait]
impl CoreApi for Core {
    async fn start_session(
        &self,
        device_id: String,
        session_type: String,
        name: String,
        config: SessionConfig,
    ) -> CoreResult<Session> {
        let id = crate::events::generate_event_id();
        let now = chrono::Utc::now().timestamp_millis();
        let session = self.sessions.start_session(id, device_id, session_type, name, now, config)?;
        self.store.create_session(session.clone()).await?;
        Ok(session)
    }

    /// `SessionManager::end_session` errors `NotFound` on a session that
    /// isn't currently active, which also covers "already ended" — so a
    /// second call here falls back to the persisted record and treats an
    /// already-closed session as success rather than propagating the error.
    async fn end_session(&self, session_id: String) -> CoreResult<Session> {
        let now = chrono::Utc::now().timestamp_millis();
        match self.sessions.end_session(&session_id, SessionStatus::Closed, now) {
            Ok((session, _resources_to_stop)) => {
                self.store.update_session(session.clone()).await?;
                Ok(session)
            }
            Err(e) if e.kind() == "not_found" => self
                .store
                .get_session(session_id.clone())
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }

    async fn get_session(&self, session_id: String) -> CoreResult<Option<Session>> {
        self.store.get_session(session_id).await
    }

    async fn list_sessions(&self, device_id: Option<String>, limit: i64) -> CoreResult<Vec<Session>> {
        self.store.list_sessions(device_id, limit).await
    }

    async fn query_events(&self, query: EventQuery) -> CoreResult<QueryPage> {
        self.store.query_events(query).await
    }

    async fn get_event(&self, event_id: String) -> CoreResult<Option<Event>> {
        self.store.get_event(event_id).await
    }

    async fn create_bookmark(&self, bookmark: Bookmark) -> CoreResult<()> {
        self.store.create_bookmark(bookmark).await
    }

    async fn delete_bookmark(&self, id: String) -> CoreResult<()> {
        self.store.delete_bookmark(id).await
    }

    async fn list_bookmarks(&self, session_id: String) -> CoreResult<Vec<Bookmark>> {
        self.store.list_bookmarks(session_id).await
    }

    async fn upsert_assertion(&self, assertion: Assertion) -> CoreResult<()> {
        self.store.upsert_assertion(assertion).await
    }

    async fn delete_assertion(&self, id: String) -> CoreResult<()> {
        self.store.delete_assertion(id).await
    }

    async fn list_assertions(&self) -> CoreResult<Vec<Assertion>> {
        self.store.list_assertions().await
    }

    async fn execute_assertion(&self, assertion_id: String, session_id: String) -> CoreResult<AssertionResult> {
        let assertions = self.store.list_assertions().await?;
        let assertion = assertions
            .into_iter()
            .find(|a| a.id == assertion_id)
            .ok_or_else(|| CoreError::not_found(format!("assertion {assertion_id} not found")))?;
        self.assertions.execute(&assertion, &session_id).await
    }

    async fn create_plugin(&self, plugin: Plugin) -> CoreResult<()> {
        if plugin.language != "native" {
            return Err(CoreError::validation(format!(
                "plugin '{}' declares unsupported language '{}'",
                plugin.name, plugin.language
            )));
        }
        self.write_plugin_record(&plugin).await?;
        if plugin.enabled {
            if let Some(builtin) = Self::resolve_builtin(&plugin.id) {
                self.plugins.load(&plugin, builtin).await?;
            }
        }
        Ok(())
    }

    async fn update_plugin(&self, plugin: Plugin) -> CoreResult<()> {
        self.plugins.unload(&plugin.id);
        self.create_plugin(plugin).await
    }

    async fn delete_plugin(&self, id: String) -> CoreResult<()> {
        self.plugins.unload(&id);
        let path = self.plugin_path(&id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::transient(format!("failed to delete plugin file: {e}"), 1)),
        }
    }

    async fn get_plugin(&self, id: String) -> CoreResult<Option<Plugin>> {
        self.read_plugin_record(&id).await
    }

    async fn list_plugins(&self) -> CoreResult<Vec<Plugin>> {
        let dir = self.config.plugins_dir();
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CoreError::transient(format!("failed to list plugins dir: {e}"), 1)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::transient(format!("failed to read plugins dir entry: {e}"), 1))?
        {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(contents) = tokio::fs::read_to_string(entry.path()).await {
                if let Ok(plugin) = serde_json::from_str(&contents) {
                    out.push(plugin);
                }
            }
        }
        Ok(out)
    }

    async fn set_plugin_enabled(&self, id: String, enabled: bool) -> CoreResult<()> {
        let mut record = self
            .read_plugin_record(&id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("plugin {id} not found")))?;
        record.enabled = enabled;
        self.write_plugin_record(&record).await?;

        if enabled {
            if !self.plugins.is_loaded(&id) {
                if let Some(builtin) = Self::resolve_builtin(&id) {
                    self.plugins.load(&record, builtin).await?;
                }
            } else {
                self.plugins.set_enabled(&id, true)?;
            }
        } else if self.plugins.is_loaded(&id) {
            self.plugins.set_enabled(&id, false)?;
        }
        Ok(())
    }

    async fn test_plugin(&self, id: String, session_id: String, limit: i64) -> CoreResult<Vec<TestPluginOutcome>> {
        let builtin = Self::resolve_builtin(&id)
            .ok_or_else(|| CoreError::not_found(format!("no built-in implementation for plugin {id}")))?;
        let harness = TestPlugin::new(self.store.clone());
        harness.run_against_session(builtin.as_ref(), &session_id, limit).await
    }

    async fn start_recording(
        &self,
        device_id: String,
        session_id: String,
        mode: RecordMode,
        script_name: String,
        device_model: String,
        screen_w: i32,
        screen_h: i32,
    ) -> CoreResult<()> {
        let mut active = self.active_recordings.lock().await;
        if active.contains_key(&device_id) {
            return Err(CoreError::already_active(format!("device {device_id} is already recording")));
        }
        let handle = self
            .recorder
            .start(&device_id, &session_id, mode, script_name, device_model, screen_w, screen_h, Arc::new(FirstCandidate))
            .await?;
        active.insert(device_id, handle);
        Ok(())
    }

    async fn stop_recording(&self, device_id: String) -> CoreResult<TouchScript> {
        let handle = self
            .active_recordings
            .lock()
            .await
            .remove(&device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id} is not recording")))?;
        handle.stop().await
    }

    async fn pause_recording(&self, device_id: String) -> CoreResult<()> {
        let active = self.active_recordings.lock().await;
        let handle = active
            .get(&device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id} is not recording")))?;
        handle.pause();
        Ok(())
    }

    async fn resume_recording(&self, device_id: String) -> CoreResult<()> {
        let active = self.active_recordings.lock().await;
        let handle = active
            .get(&device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id} is not recording")))?;
        handle.resume();
        Ok(())
    }

    async fn save_script(&self, script: TouchScript) -> CoreResult<()> {
        let dir = self.config.scripts_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::transient(format!("failed to create scripts dir: {e}"), 1))?;
        let json = serde_json::to_string_pretty(&script)
            .map_err(|e| CoreError::validation(format!("failed to serialize script: {e}")))?;
        tokio::fs::write(self.script_path(&script.name), json)
            .await
            .map_err(|e| CoreError::transient(format!("failed to write script file: {e}"), 1))
    }

    async fn load_script(&self, name: String) -> CoreResult<TouchScript> {
        let path = self.script_path(&name);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| CoreError::not_found(format!("script '{name}' not found")))?;
        serde_json::from_str(&contents).map_err(|e| CoreError::validation(format!("corrupt script file {}: {e}", path.display())))
    }

    async fn list_scripts(&self) -> CoreResult<Vec<String>> {
        let dir = self.config.scripts_dir();
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CoreError::transient(format!("failed to list scripts dir: {e}"), 1)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::transient(format!("failed to read scripts dir entry: {e}"), 1))?
        {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    out.push(stem.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn rename_script(&self, old_name: String, new_name: String) -> CoreResult<()> {
        let mut script = self.load_script(old_name.clone()).await?;
        script.name = new_name;
        self.save_script(script).await?;
        self.delete_script(old_name).await
    }

    async fn delete_script(&self, name: String) -> CoreResult<()> {
        match tokio::fs::remove_file(self.script_path(&name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::transient(format!("failed to delete script file: {e}"), 1)),
        }
    }

    async fn play_script(&self, name: String, device_id: String, target_w: i32, target_h: i32) -> CoreResult<()> {
        let mut active = self.active_playbacks.lock().await;
        if active.contains_key(&device_id) {
            return Err(CoreError::already_active(format!("device {device_id} already has a script playing")));
        }
        let script = self.load_script(name).await?;
        let handle = self.player.play(script, &device_id, target_w, target_h).await?;
        active.insert(device_id, handle);
        Ok(())
    }

    async fn stop_playback(&self, device_id: String) -> CoreResult<()> {
        let handle = self
            .active_playbacks
            .lock()
            .await
            .remove(&device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id} has no playback in progress")))?;
        handle.stop().await
    }

    async fn pause_playback(&self, device_id: String) -> CoreResult<()> {
        let active = self.active_playbacks.lock().await;
        let handle = active
            .get(&device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id} has no playback in progress")))?;
        handle.pause();
        Ok(())
    }

    async fn resume_playback(&self, device_id: String) -> CoreResult<()> {
        let active = self.active_playbacks.lock().await;
        let handle = active
            .get(&device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id} has no playback in progress")))?;
        handle.resume();
        Ok(())
    }

    async fn dump_ui(&self, device_id: String) -> CoreResult<Vec<UiNode>> {
        ui::dump(self.bridge.as_ref(), &device_id, &self.config.ui).await
    }

    async fn search_ui(&self, device_id: String, expression: String) -> CoreResult<Vec<UiNode>> {
        let nodes = ui::dump(self.bridge.as_ref(), &device_id, &self.config.ui).await?;
        Ok(ui::find_by_expression(&nodes, &expression).into_iter().cloned().collect())
    }
}
