//! Process logging set-up.
//!
//! The queue itself only emits `tracing` events. A binary embedding it calls [`init`] once to
//! route them: to stderr by default, or appended to a file when a debug log path is configured.
//! `RUST_LOG` overrides the level filter when set.

use crate::config::DebugLog;
use std::fs::OpenOptions;
use std::sync::Mutex;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open debug log: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when no debug log is configured.
    pub level: Level,
    pub debug_log: DebugLog,
    pub ansi_colors: bool,
    pub with_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            debug_log: DebugLog::Off,
            ansi_colors: true,
            with_thread_names: false,
        }
    }
}

impl LogConfig {
    /// Debug-level events appended to `debug_log`.
    pub fn debug_to(debug_log: DebugLog) -> Self {
        Self {
            debug_log,
            with_thread_names: true,
            ..Self::default()
        }
    }

    fn effective_level(&self) -> Level {
        if self.debug_log.is_enabled() {
            Level::DEBUG
        } else {
            self.level
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let level = config.effective_level();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    match &config.debug_log {
        DebugLog::Off => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(config.ansi_colors)
                .with_target(true)
                .with_thread_names(config.with_thread_names)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
        DebugLog::Path(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(config.with_thread_names)
                .with_writer(Mutex::new(file));

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }
    Ok(())
}
