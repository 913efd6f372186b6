//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! The YAML file lists one entry per capture thread; everything else has defaults.

use crate::packet::DEFAULT_PACKET_BUFFER;
use crate::tracker::{TrackerOptions, DEFAULT_EVICTION_PAUSE, DEFAULT_LOOKUP_CONCURRENCY};
use crate::{Result, TrackerError};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Duration in string form like "30s", "100ms", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let secs = match unit {
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "s" | "sec" | "secs" | "second" | "seconds" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "" => value, // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Duration out of range '{}': {}", s, e))
    }
}

/// Directories and eviction threshold of one capture thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub packets_directory: PathBuf,
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub index_directory: PathBuf,
    /// Evict while free space on the packet filesystem is at or below this
    pub disk_free_percentage: u8,
}

/// Periodic sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_eviction_pause", with = "duration_serde")]
    pub eviction_pause: Duration,
    /// A thread with no new blockfile for this long reports as stale
    #[serde(default = "default_stale_after", with = "duration_serde")]
    pub stale_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_sync_interval(),
            eviction_pause: default_eviction_pause(),
            stale_after: default_stale_after(),
        }
    }
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_eviction_pause() -> Duration {
    DEFAULT_EVICTION_PAUSE
}

fn default_stale_after() -> Duration {
    Duration::from_secs(300)
}

/// Query fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    #[serde(default = "default_lookup_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_packet_buffer")]
    pub packet_buffer: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            concurrency: default_lookup_concurrency(),
            packet_buffer: default_packet_buffer(),
        }
    }
}

fn default_lookup_concurrency() -> usize {
    DEFAULT_LOOKUP_CONCURRENCY
}

fn default_packet_buffer() -> usize {
    DEFAULT_PACKET_BUFFER
}

/// Debug HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_debug_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_debug_port")]
    pub port: u16,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_debug_bind_address(),
            port: default_debug_port(),
        }
    }
}

fn default_debug_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_debug_port() -> u16 {
    8089
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Daily-rolling application log directory; console only when unset
    #[serde(default)]
    pub app_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the `PKT<id>` / `IDX<id>` links are created
    #[serde(default = "default_base_dir", deserialize_with = "pathbuf_serde::deserialize")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub threads: Vec<ThreadConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/capture-tracker")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            threads: Vec::new(),
            sync: SyncConfig::default(),
            lookup: LookupConfig::default(),
            debug: DebugConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::load_with_matches(&matches)
    }

    /// Same as `load` with already-parsed arguments
    pub fn load_with_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides();
        config.apply_cli_overrides(matches);
        config.validate()?;

        info!(
            "Tracking {} capture threads under {} (sync every {:?}, eviction pause {:?})",
            config.threads.len(),
            config.base_dir.display(),
            config.sync.interval,
            config.sync.eviction_pause
        );
        if config.debug.enabled {
            info!(
                "Debug listener enabled on {}:{}",
                config.debug.bind_address, config.debug.port
            );
        } else {
            info!("Debug listener disabled");
        }
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("capture-tracker")
            .version(env!("CARGO_PKG_VERSION"))
            .about(
                "Tracks capture blockfiles, answers queries across them \
                 and evicts the oldest on low disk",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("base-dir")
                    .long("base-dir")
                    .value_name("DIR")
                    .help("Directory holding the per-thread packet and index links"),
            )
            .arg(
                Arg::new("debug-port")
                    .long("debug-port")
                    .value_name("PORT")
                    .help("Enable the debug listener on this port"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config = Self::from_yaml(&content).map_err(|e| {
            TrackerError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(base_dir) = var("CAPTURE_BASE_DIR") {
            self.base_dir = pathbuf_serde::expand_tilde(&base_dir);
        }

        if let Some(interval) = var("SYNC_INTERVAL") {
            if let Ok(interval) = duration_serde::parse_duration(&interval) {
                self.sync.interval = interval;
            }
        }

        if let Some(pause) = var("EVICTION_PAUSE") {
            if let Ok(pause) = duration_serde::parse_duration(&pause) {
                self.sync.eviction_pause = pause;
            }
        }

        if let Some(concurrency) = var("LOOKUP_CONCURRENCY") {
            if let Ok(concurrency) = concurrency.parse() {
                self.lookup.concurrency = concurrency;
            }
        }

        if let Some(port) = var("DEBUG_PORT") {
            if let Ok(port) = port.parse() {
                self.debug.port = port;
            }
        }

        if let Some(enabled) = var("DEBUG_ENABLED") {
            self.debug.enabled = enabled.to_lowercase() == "true";
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }
    }

    /// Apply command line argument overrides
    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(base_dir) = matches.get_one::<String>("base-dir") {
            self.base_dir = PathBuf::from(base_dir);
        }

        if let Some(port) = matches.get_one::<String>("debug-port") {
            if let Ok(port) = port.parse() {
                self.debug.port = port;
                self.debug.enabled = true;
            }
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }
    }

    /// Reject configurations the tracker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.threads.is_empty() {
            return Err(TrackerError::ConfigError(
                "At least one capture thread must be configured".to_string(),
            ));
        }

        for (id, thread) in self.threads.iter().enumerate() {
            if thread.disk_free_percentage > 100 {
                return Err(TrackerError::ConfigError(format!(
                    "Thread {} disk_free_percentage must be between 0 and 100, got {}",
                    id, thread.disk_free_percentage
                )));
            }
        }

        if self.lookup.concurrency == 0 {
            return Err(TrackerError::ConfigError(
                "Lookup concurrency must be at least 1".to_string(),
            ));
        }

        if self.lookup.packet_buffer == 0 {
            return Err(TrackerError::ConfigError(
                "Lookup packet_buffer must be at least 1".to_string(),
            ));
        }

        if self.sync.interval < Duration::from_secs(1) {
            return Err(TrackerError::ConfigError(format!(
                "Sync interval must be at least 1s, got {:?}",
                self.sync.interval
            )));
        }

        Ok(())
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            eviction_pause: self.sync.eviction_pause,
            lookup_concurrency: self.lookup.concurrency,
            packet_buffer: self.lookup.packet_buffer,
        }
    }
}
