//! Logging Module
//!
//! Installs the global tracing subscriber: console output always, plus a
//! daily-rolling application log when a log directory is configured.

use crate::config::LoggingConfig;
use crate::{Result, TrackerError};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Days of rolled application logs kept on disk
pub const LOG_RETENTION_DAYS: u64 = 14;

const LOG_FILE_PREFIX: &str = "capture-tracker.log";

/// Logger manager for handling all logging operations
pub struct LoggerManager {
    pub config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Host-specific directory for rolled log files, if file logging is on
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Initialize the logging system
    pub fn initialize(&self) -> Result<()> {
        let host_log_dir = self.host_log_dir();
        if let Some(dir) = &host_log_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                TrackerError::IoError(format!("Failed to create app log directory: {}", e))
            })?;
        }

        let file_layer = host_log_dir.as_ref().map(|dir| {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .compact()
        });

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = &host_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        if let Some(dir) = &host_log_dir {
            let retention = Duration::from_secs(LOG_RETENTION_DAYS * 24 * 3600);
            let removed = cleanup_old_logs(dir, retention);
            if removed > 0 {
                info!("Removed {} expired log files from {:?}", removed, dir);
            }
        }

        Ok(())
    }
}

/// Remove rolled log files last modified more than `keep` ago. Returns how
/// many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep: Duration) -> usize {
    let Some(cutoff_time) = SystemTime::now().checked_sub(keep) else {
        return 0;
    };

    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let is_log = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if !is_log {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if modified >= cutoff_time {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Removed old log file: {:?}", entry.path());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old log file {:?}: {}", entry.path(), e),
            }
        }
    }
    removed
}
