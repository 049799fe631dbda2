//! Tracing subscriber setup

use std::fs::{create_dir_all, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};

/// Install the global subscriber: JSON lines on stdout, plus a plain-text
/// log file when `log_file` is configured.
pub fn init(config: &WatcherConfig) -> Result<()> {
    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let file_layer = if config.log_file.is_empty() {
        None
    } else {
        let path = Path::new(&config.log_file);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_dir_all(dir).map_err(|e| {
                WatcherError::ConfigError(format!("Cannot create log directory {}: {}", dir.display(), e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| WatcherError::ConfigError(format!("Cannot open log file {}: {}", path.display(), e)))?;
        Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .with(file_layer)
        .try_init()
        .map_err(|e| WatcherError::ConfigError(format!("Failed to install logger: {}", e)))
}
