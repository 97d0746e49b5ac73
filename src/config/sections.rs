//! Per-subsystem config sections, each with a `FileXxx` deserialization
//! counterpart and a `from_file(Option<FileXxx>) -> Xxx` merge against
//! defaults.

use serde::Deserialize;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl LogRotation {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "never" => Self::Never,
            _ => Self::Daily,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Never => "never",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "devbench_core=debug".
    pub level: String,
    pub file_enabled: bool,
    pub file_dir: PathBuf,
    pub file_rotation: LogRotation,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file_enabled: false,
            file_dir: PathBuf::from("./logs"),
            file_rotation: LogRotation::Daily,
            file_prefix: "devbenchd".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileLogging {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<String>,
    pub file_rotation: Option<String>,
    pub file_prefix: Option<String>,
}

impl LoggingConfig {
    pub fn from_file(file: Option<FileLogging>) -> Self {
        let file = file.unwrap_or_default();
        let d = Self::default();
        LoggingConfig {
            level: file.level.unwrap_or(d.level),
            file_enabled: file.file_enabled.unwrap_or(d.file_enabled),
            file_dir: file.file_dir.map(PathBuf::from).unwrap_or(d.file_dir),
            file_rotation: file.file_rotation.map(|s| LogRotation::from_str(&s)).unwrap_or(d.file_rotation),
            file_prefix: file.file_prefix.unwrap_or(d.file_prefix),
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "[logging]\nlevel = \"{}\"\nfile_enabled = {}\nfile_dir = \"{}\"\nfile_rotation = \"{}\"\nfile_prefix = \"{}\"\n\n",
            self.level,
            self.file_enabled,
            self.file_dir.display(),
            self.file_rotation.as_str(),
            self.file_prefix,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreSection {
    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    pub channel_buffer: usize,
    pub retention_days: Option<u32>,
    pub read_pool_size: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection {
            flush_batch_size: 500,
            flush_interval_ms: 500,
            channel_buffer: 1000,
            retention_days: Some(90),
            read_pool_size: 4,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileStoreSection {
    pub flush_batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub channel_buffer: Option<usize>,
    pub retention_days: Option<i64>,
    pub read_pool_size: Option<u32>,
}

impl StoreSection {
    pub fn from_file(file: Option<FileStoreSection>) -> Self {
        let file = file.unwrap_or_default();
        let d = Self::default();
        StoreSection {
            flush_batch_size: file.flush_batch_size.unwrap_or(d.flush_batch_size),
            flush_interval_ms: file.flush_interval_ms.unwrap_or(d.flush_interval_ms),
            channel_buffer: file.channel_buffer.unwrap_or(d.channel_buffer),
            retention_days: match file.retention_days {
                Some(n) if n <= 0 => None,
                Some(n) => Some(n as u32),
                None => d.retention_days,
            },
            read_pool_size: file.read_pool_size.unwrap_or(d.read_pool_size),
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "[store]\nflush_batch_size = {}\nflush_interval_ms = {}\nchannel_buffer = {}\nretention_days = {}\nread_pool_size = {}\n\n",
            self.flush_batch_size,
            self.flush_interval_ms,
            self.channel_buffer,
            self.retention_days.map(|d| d.to_string()).unwrap_or_else(|| "0  # disabled".to_string()),
            self.read_pool_size,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineSection {
    pub intake_capacity: usize,
    pub warn_block_budget_ms: u64,
    pub recent_ring_capacity: usize,
    pub frontend_channel_capacity: usize,
    pub aggregation_window_ms: u64,
    pub max_derivation_depth: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        PipelineSection {
            intake_capacity: 10_000,
            warn_block_budget_ms: 50,
            recent_ring_capacity: 500,
            frontend_channel_capacity: 1000,
            aggregation_window_ms: 1000,
            max_derivation_depth: 3,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FilePipelineSection {
    pub intake_capacity: Option<usize>,
    pub warn_block_budget_ms: Option<u64>,
    pub recent_ring_capacity: Option<usize>,
    pub frontend_channel_capacity: Option<usize>,
    pub aggregation_window_ms: Option<u64>,
    pub max_derivation_depth: Option<u32>,
}

impl PipelineSection {
    pub fn from_file(file: Option<FilePipelineSection>) -> Self {
        let file = file.unwrap_or_default();
        let d = Self::default();
        PipelineSection {
            intake_capacity: file.intake_capacity.unwrap_or(d.intake_capacity),
            warn_block_budget_ms: file.warn_block_budget_ms.unwrap_or(d.warn_block_budget_ms),
            recent_ring_capacity: file.recent_ring_capacity.unwrap_or(d.recent_ring_capacity),
            frontend_channel_capacity: file.frontend_channel_capacity.unwrap_or(d.frontend_channel_capacity),
            aggregation_window_ms: file.aggregation_window_ms.unwrap_or(d.aggregation_window_ms),
            max_derivation_depth: file.max_derivation_depth.unwrap_or(d.max_derivation_depth),
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "[pipeline]\nintake_capacity = {}\nwarn_block_budget_ms = {}\nrecent_ring_capacity = {}\nfrontend_channel_capacity = {}\naggregation_window_ms = {}\nmax_derivation_depth = {}\n\n",
            self.intake_capacity,
            self.warn_block_budget_ms,
            self.recent_ring_capacity,
            self.frontend_channel_capacity,
            self.aggregation_window_ms,
            self.max_derivation_depth,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Plugins
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PluginSection {
    pub event_budget_ms: u64,
    pub max_derived_per_primary: usize,
    pub max_depth: u32,
    pub strike_window_secs: u64,
    pub strikes_to_disable: u32,
}

impl Default for PluginSection {
    fn default() -> Self {
        PluginSection {
            event_budget_ms: 200,
            max_derived_per_primary: 8,
            max_depth: 3,
            strike_window_secs: 60,
            strikes_to_disable: 3,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FilePluginSection {
    pub event_budget_ms: Option<u64>,
    pub max_derived_per_primary: Option<usize>,
    pub max_depth: Option<u32>,
    pub strike_window_secs: Option<u64>,
    pub strikes_to_disable: Option<u32>,
}

impl PluginSection {
    pub fn from_file(file: Option<FilePluginSection>) -> Self {
        let file = file.unwrap_or_default();
        let d = Self::default();
        PluginSection {
            event_budget_ms: file.event_budget_ms.unwrap_or(d.event_budget_ms),
            max_derived_per_primary: file.max_derived_per_primary.unwrap_or(d.max_derived_per_primary),
            max_depth: file.max_depth.unwrap_or(d.max_depth),
            strike_window_secs: file.strike_window_secs.unwrap_or(d.strike_window_secs),
            strikes_to_disable: file.strikes_to_disable.unwrap_or(d.strikes_to_disable),
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "[plugins]\nevent_budget_ms = {}\nmax_derived_per_primary = {}\nmax_depth = {}\nstrike_window_secs = {}\nstrikes_to_disable = {}\n\n",
            self.event_budget_ms,
            self.max_derived_per_primary,
            self.max_depth,
            self.strike_window_secs,
            self.strikes_to_disable,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Touch recorder / player
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TouchSection {
    /// Keywords scored +10 when found in an input device's name (case-insensitive).
    pub device_keywords: Vec<String>,
    pub long_press_ms: u64,
    pub tap_distance_sq_px: i64,
    pub gap_compress_threshold_ms: i64,
    pub gap_compress_to_ms: i64,
    pub precise_dump_min_interval_ms: u64,
    pub precise_dump_cache_ms: u64,
    pub smart_resolve_retry_ms: u64,
    pub smart_resolve_timeout_ms: u64,
}

impl Default for TouchSection {
    fn default() -> Self {
        TouchSection {
            device_keywords: vec!["touch".into(), "touchscreen".into(), "ts".into(), "gt9".into(), "synaptics".into()],
            long_press_ms: 500,
            tap_distance_sq_px: 2500,
            gap_compress_threshold_ms: 800,
            gap_compress_to_ms: 400,
            precise_dump_min_interval_ms: 500,
            precise_dump_cache_ms: 2000,
            smart_resolve_retry_ms: 800,
            smart_resolve_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileTouchSection {
    pub device_keywords: Option<Vec<String>>,
    pub long_press_ms: Option<u64>,
    pub tap_distance_sq_px: Option<i64>,
    pub gap_compress_threshold_ms: Option<i64>,
    pub gap_compress_to_ms: Option<i64>,
    pub precise_dump_min_interval_ms: Option<u64>,
    pub precise_dump_cache_ms: Option<u64>,
    pub smart_resolve_retry_ms: Option<u64>,
    pub smart_resolve_timeout_ms: Option<u64>,
}

impl TouchSection {
    pub fn from_file(file: Option<FileTouchSection>) -> Self {
        let file = file.unwrap_or_default();
        let d = Self::default();
        TouchSection {
            device_keywords: file.device_keywords.unwrap_or(d.device_keywords),
            long_press_ms: file.long_press_ms.unwrap_or(d.long_press_ms),
            tap_distance_sq_px: file.tap_distance_sq_px.unwrap_or(d.tap_distance_sq_px),
            gap_compress_threshold_ms: file.gap_compress_threshold_ms.unwrap_or(d.gap_compress_threshold_ms),
            gap_compress_to_ms: file.gap_compress_to_ms.unwrap_or(d.gap_compress_to_ms),
            precise_dump_min_interval_ms: file.precise_dump_min_interval_ms.unwrap_or(d.precise_dump_min_interval_ms),
            precise_dump_cache_ms: file.precise_dump_cache_ms.unwrap_or(d.precise_dump_cache_ms),
            smart_resolve_retry_ms: file.smart_resolve_retry_ms.unwrap_or(d.smart_resolve_retry_ms),
            smart_resolve_timeout_ms: file.smart_resolve_timeout_ms.unwrap_or(d.smart_resolve_timeout_ms),
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "[touch]\ndevice_keywords = {:?}\nlong_press_ms = {}\ntap_distance_sq_px = {}\ngap_compress_threshold_ms = {}\ngap_compress_to_ms = {}\nprecise_dump_min_interval_ms = {}\nprecise_dump_cache_ms = {}\nsmart_resolve_retry_ms = {}\nsmart_resolve_timeout_ms = {}\n\n",
            self.device_keywords,
            self.long_press_ms,
            self.tap_distance_sq_px,
            self.gap_compress_threshold_ms,
            self.gap_compress_to_ms,
            self.precise_dump_min_interval_ms,
            self.precise_dump_cache_ms,
            self.smart_resolve_retry_ms,
            self.smart_resolve_timeout_ms,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────
// UI hierarchy
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UiSection {
    pub dump_timeout_ms: u64,
    pub dump_retries: u32,
}

impl Default for UiSection {
    fn default() -> Self {
        UiSection {
            dump_timeout_ms: 30_000,
            dump_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileUiSection {
    pub dump_timeout_ms: Option<u64>,
    pub dump_retries: Option<u32>,
}

impl UiSection {
    pub fn from_file(file: Option<FileUiSection>) -> Self {
        let file = file.unwrap_or_default();
        let d = Self::default();
        UiSection {
            dump_timeout_ms: file.dump_timeout_ms.unwrap_or(d.dump_timeout_ms),
            dump_retries: file.dump_retries.unwrap_or(d.dump_retries),
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "[ui]\ndump_timeout_ms = {}\ndump_retries = {}\n\n",
            self.dump_timeout_ms, self.dump_retries,
        )
    }
}
