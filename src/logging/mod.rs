//! Tracing initialization: an `EnvFilter`-driven `fmt` layer to stdout,
//! plus an optional rolling file appender when `logging.file_enabled` is
//! set. No TUI capture layer — this core has no terminal UI to protect
//! from log lines tearing through an alternate screen buffer.

use crate::config::{LogRotation, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Holding the returned guard keeps the file-appender worker thread alive
/// for the life of the process; dropping it flushes and stops it.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if !config.file_enabled {
        tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        return None;
    }

    let rotation = match config.file_rotation {
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender = tracing_appender::rolling::RollingFileAppender::new(rotation, &config.file_dir, &config.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    Some(guard)
}
