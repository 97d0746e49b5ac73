//! Configuration for the core.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/devbench/config.toml)
//! 3. Built-in defaults (lowest priority)

mod sections;
#[cfg(test)]
mod tests;

pub use sections::{
    LogRotation, LoggingConfig, PipelineSection, PluginSection, StoreSection, TouchSection,
    UiSection,
};

use serde::Deserialize;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Config {
    /// Device serial to target when none is given on the command line.
    pub device_id: Option<String>,

    /// Path to the adb-compatible binary the bridge shells out to.
    pub adb_binary: String,

    /// Directory holding the event database, scripts/ and plugins/ subdirs.
    pub data_dir: PathBuf,

    pub logging: LoggingConfig,
    pub store: StoreSection,
    pub pipeline: PipelineSection,
    pub plugins: PluginSection,
    pub touch: TouchSection,
    pub ui: UiSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: None,
            adb_binary: "adb".to_string(),
            data_dir: default_data_dir(),
            logging: LoggingConfig::default(),
            store: StoreSection::default(),
            pipeline: PipelineSection::default(),
            plugins: PluginSection::default(),
            touch: TouchSection::default(),
            ui: UiSection::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|p| p.join(".local").join("share").join("devbench"))
        .unwrap_or_else(|| PathBuf::from("./devbench-data"))
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("events.db")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir.join("plugins")
    }

    /// `~/.config/devbench/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("devbench").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist. Called during
    /// startup to help users discover configuration options.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("\nconfig error: failed to parse {}\n\n  {}\n", path.display(), e);
                    eprintln!("to reset, delete the file and restart devbenchd.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\nconfig error: cannot read {}\n\n  {}\n", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars > config file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        let device_id = std::env::var("DEVBENCH_DEVICE").ok().or(file.device_id);

        let adb_binary = std::env::var("DEVBENCH_ADB")
            .ok()
            .or(file.adb_binary)
            .unwrap_or_else(|| "adb".to_string());

        let data_dir = std::env::var("DEVBENCH_DATA_DIR")
            .ok()
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let logging = LoggingConfig::from_file(file.logging);
        let store = StoreSection::from_file(file.store);
        let pipeline = PipelineSection::from_file(file.pipeline);
        let plugins = PluginSection::from_file(file.plugins);
        let touch = TouchSection::from_file(file.touch);
        let ui = UiSection::from_file(file.ui);

        Self {
            device_id,
            adb_binary,
            data_dir,
            logging,
            store,
            pipeline,
            plugins,
            touch,
            ui,
        }
    }

    /// Single source of truth for the on-disk config format.
    pub fn to_toml(&self) -> String {
        let mut out = String::new();
        out.push_str("# devbenchd configuration\n");
        out.push_str("# env vars (DEVBENCH_*) override values here; unset fields fall back to defaults.\n\n");
        if let Some(d) = &self.device_id {
            out.push_str(&format!("device_id = \"{d}\"\n"));
        } else {
            out.push_str("# device_id = \"emulator-5554\"\n");
        }
        out.push_str(&format!("adb_binary = \"{}\"\n", self.adb_binary));
        out.push_str(&format!("data_dir = \"{}\"\n\n", self.data_dir.display()));
        out.push_str(&self.logging.to_toml());
        out.push_str(&self.store.to_toml());
        out.push_str(&self.pipeline.to_toml());
        out.push_str(&self.plugins.to_toml());
        out.push_str(&self.touch.to_toml());
        out.push_str(&self.ui.to_toml());
        out
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub device_id: Option<String>,
    pub adb_binary: Option<String>,
    pub data_dir: Option<String>,
    pub logging: Option<sections::FileLogging>,
    pub store: Option<sections::FileStoreSection>,
    pub pipeline: Option<sections::FilePipelineSection>,
    pub plugins: Option<sections::FilePluginSection>,
    pub touch: Option<sections::FileTouchSection>,
    pub ui: Option<sections::FileUiSection>,
}
