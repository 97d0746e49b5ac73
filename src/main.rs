// devbenchd - observation and automation core for an Android device
// workstation.
//
// Architecture:
// - Bridge: shells out to adb for device I/O (exec, streamed getevent/logcat, push/pull)
// - EventPipeline: single ingress, fixed fan-out to the store, frontend push,
//   recent-event ring, and the plugin manager
// - EventStore: a single writer thread over SQLite, read pool for queries
// - AssertionEngine / PluginManager: declarative checks and derived events
// - TouchRecorder / ScriptPlayer: touch capture and replay against the UI hierarchy
// - CoreApi: the control surface every operation above is reachable through

mod api;
mod assertions;
mod bridge;
mod cli;
mod config;
mod error;
mod events;
mod logging;
mod pipeline;
mod plugins;
mod store;
mod touch;
mod ui;

use anyhow::{Context, Result};
use api::Core;
use bridge::AdbBridge;
use clap::Parser;
use cli::Cli;
use config::Config;
use pipeline::{EventPipeline, PipelineConfig, SessionManager, SessionManagerConfig};
use plugins::{builtin, PluginManager, PluginManagerConfig, PluginManagerSink};
use std::sync::Arc;
use std::time::Duration;
use store::{EventStore, StoreConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli::handle_cli(&cli) {
        return Ok(());
    }

    Config::ensure_config_exists();
    let mut config = Config::from_env();
    if let Some(device) = cli.device.clone() {
        config.device_id = Some(device);
    }

    let _log_guard = logging::init(&config.logging);
    info!(version = %config::VERSION, "devbenchd starting");

    std::fs::create_dir_all(&config.data_dir).context("failed to create data directory")?;
    std::fs::create_dir_all(config.scripts_dir()).context("failed to create scripts directory")?;
    std::fs::create_dir_all(config.plugins_dir()).context("failed to create plugins directory")?;

    let store_config = StoreConfig {
        db_path: cli.db.clone().unwrap_or_else(|| config.db_path()),
        flush_batch_size: config.store.flush_batch_size,
        flush_interval: Duration::from_millis(config.store.flush_interval_ms),
        channel_buffer: config.store.channel_buffer,
        retention_days: config.store.retention_days,
        read_pool_size: config.store.read_pool_size,
    };
    let store = Arc::new(EventStore::open(store_config).context("failed to open event store")?);

    let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()));

    let plugin_manager = Arc::new(PluginManager::new(
        PluginManagerConfig {
            event_budget: Duration::from_millis(config.plugins.event_budget_ms),
            max_derived_per_primary: config.plugins.max_derived_per_primary,
            max_depth: config.plugins.max_depth,
            strike_window: Duration::from_secs(config.plugins.strike_window_secs),
            strikes_to_disable: config.plugins.strikes_to_disable,
        },
        store.clone(),
    ));
    load_builtin_plugins(&plugin_manager, &config).await;

    let pipeline_config = PipelineConfig {
        intake_capacity: config.pipeline.intake_capacity,
        warn_block_budget: Duration::from_millis(config.pipeline.warn_block_budget_ms),
        recent_ring_capacity: config.pipeline.recent_ring_capacity,
        frontend_channel_capacity: config.pipeline.frontend_channel_capacity,
        aggregation_window: Duration::from_millis(config.pipeline.aggregation_window_ms),
        max_derivation_depth: config.pipeline.max_derivation_depth,
    };
    let plugin_sink: Arc<dyn pipeline::EventSink> = Arc::new(PluginManagerSink(plugin_manager.clone()));
    let pipeline = EventPipeline::start(pipeline_config, store.clone(), sessions.clone(), plugin_sink);
    plugin_manager.attach_pipeline(pipeline.clone());

    let bridge: Arc<dyn bridge::DeviceBridge> = Arc::new(AdbBridge::new(config.adb_binary.clone()));

    let core = Arc::new(Core::new(config.clone(), bridge, store.clone(), pipeline.clone(), sessions, plugin_manager));
    let _ = core; // held for the lifetime of the process; a transport would dispatch to it here.

    info!(data_dir = %config.data_dir.display(), "devbenchd ready");

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    pipeline.stop(Duration::from_secs(5)).await;
    store.shutdown().await.context("event store shutdown failed")?;

    info!("devbenchd stopped");
    Ok(())
}

async fn load_builtin_plugins(manager: &Arc<PluginManager>, config: &Config) {
    let specs: &[(&str, &str)] = &[
        (builtin::ERROR_COUNTER_ID, "Error Counter"),
        (builtin::DOUBLE_TAP_ID, "Double Tap Detector"),
    ];
    for (id, name) in specs {
        let (id, name) = (*id, *name);
        let path = config.plugins_dir().join(format!("{id}.json"));
        let record = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| default_plugin_record(id, name)),
            Err(_) => default_plugin_record(id, name),
        };
        if !record.enabled {
            continue;
        }
        let derivation: Arc<dyn plugins::DerivationPlugin> = match id {
            builtin::ERROR_COUNTER_ID => Arc::new(builtin::ErrorCounterPlugin::default()),
            builtin::DOUBLE_TAP_ID => Arc::new(builtin::DoubleTapPlugin::default()),
            _ => continue,
        };
        if let Err(e) = manager.load(&record, derivation).await {
            tracing::warn!(plugin = %id, error = %e, "failed to load built-in plugin");
        }
    }
}

fn default_plugin_record(id: &str, name: &str) -> events::Plugin {
    let now = chrono::Utc::now().to_rfc3339();
    events::Plugin {
        id: id.to_string(),
        name: name.to_string(),
        version: config::VERSION.to_string(),
        author: Some("devbench".to_string()),
        description: None,
        enabled: true,
        filters: events::EventCriteria::default(),
        config: Default::default(),
        language: "native".to_string(),
        source_code: String::new(),
        compiled_code: None,
        state: Default::default(),
        created_at: now.clone(),
        updated_at: now,
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
