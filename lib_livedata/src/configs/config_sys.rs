//! # Engine Configuration
//!
//! Every setting is optional on every layer. Layers are merged field by field,
//! later layers winning:
//!
//! 1. built-in defaults,
//! 2. the JSON config file (`--config-path` / `LIVEDATA_CONFIG_PATH`, default
//!    `server_live.conf`),
//! 3. environment variables and CLI flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::configs::ConfigError;
use crate::core::{ContextSettings, OwnerSettings};

/// Config file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "server_live.conf";
/// Definitions file looked up when no path is given.
pub const DEFAULT_DEFINITIONS_FILE: &str = "definitions.json";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Live data distribution server", version)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[clap(long, env = "LIVEDATA_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LIVEDATA_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LIVEDATA_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LIVEDATA_DEFINITIONS_PATH", help = "Path to the JSON definitions file.")]
    pub definitions_path: Option<PathBuf>,

    #[clap(long, env = "LIVEDATA_EVENTS_PATH", help = "JSON-lines event file to ingest; stdin when absent.")]
    pub events_path: Option<PathBuf>,

    #[clap(long, env = "LIVEDATA_IDLE_TIMEOUT_SECONDS", help = "Seconds a member or user list may stay unused before eviction.")]
    pub idle_timeout_seconds: Option<u64>,

    #[clap(long, env = "LIVEDATA_CLEANUP_INTERVAL_SECONDS", help = "Interval in seconds between idle list sweeps.")]
    pub cleanup_interval_seconds: Option<u64>,

    #[clap(long, env = "LIVEDATA_PULSE_MILLIS", help = "Clock pulse period in milliseconds.")]
    pub pulse_millis: Option<u64>,

    #[clap(long, env = "LIVEDATA_QUEUE_HIGH_WATER", help = "Queue length above which a warning is logged.")]
    pub queue_high_water: Option<usize>,

    #[clap(long, env = "LIVEDATA_MONITOR_INTERVAL_SECONDS", help = "Interval in seconds between queue monitor reports.")]
    pub monitor_interval_seconds: Option<u64>,
}

impl EngineConfig {
    /// Built-in defaults.
    pub fn defaults() -> Self {
        EngineConfig {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            idle_timeout_seconds: Some(300),
            cleanup_interval_seconds: Some(60),
            pulse_millis: Some(1000),
            queue_high_water: Some(100_000),
            monitor_interval_seconds: Some(30),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: EngineConfig) -> EngineConfig {
        EngineConfig {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            definitions_path: other.definitions_path.or(self.definitions_path),
            events_path: other.events_path.or(self.events_path),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            cleanup_interval_seconds: other.cleanup_interval_seconds.or(self.cleanup_interval_seconds),
            pulse_millis: other.pulse_millis.or(self.pulse_millis),
            queue_high_water: other.queue_high_water.or(self.queue_high_water),
            monitor_interval_seconds: other.monitor_interval_seconds.or(self.monitor_interval_seconds),
        }
    }

    /// Log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    /// Log level name.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Definitions file: the configured path, else `definitions.json` in the
    /// working directory, else the one in the user's config directory.
    pub fn definitions_path(&self) -> PathBuf {
        if let Some(path) = &self.definitions_path {
            return path.clone();
        }
        let local = PathBuf::from(DEFAULT_DEFINITIONS_FILE);
        if local.exists() {
            return local;
        }
        match dirs::config_dir() {
            Some(dir) => dir.join("livedata").join(DEFAULT_DEFINITIONS_FILE),
            None => local,
        }
    }

    /// Queue monitor period.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds.unwrap_or(30))
    }

    /// Engine settings, refusing zero periods.
    pub fn context_settings(&self) -> Result<ContextSettings, ConfigError> {
        let defaults = ContextSettings::default();
        let pulse = self
            .pulse_millis
            .map(Duration::from_millis)
            .unwrap_or(defaults.pulse_period);
        let cleanup = self
            .cleanup_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.owners.cleanup_interval);
        for (name, period) in [("pulseMillis", pulse), ("cleanupIntervalSeconds", cleanup)] {
            if period.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(ContextSettings {
            high_water: self.queue_high_water.unwrap_or(defaults.high_water),
            pulse_period: pulse,
            owners: OwnerSettings {
                idle_timeout: self
                    .idle_timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.owners.idle_timeout),
                cleanup_interval: cleanup,
            },
        })
    }
}

/// Reads one config file layer. A missing file is an empty layer.
pub fn read_config_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return Ok(EngineConfig::default());
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merges defaults, the config file named by `cli` (or the default file) and
/// `cli` itself.
pub fn resolve_config(cli: EngineConfig) -> Result<EngineConfig, ConfigError> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file_config = read_config_file(&config_file_path)?;
    Ok(EngineConfig::defaults().merge(file_config).merge(cli))
}

/// Loads the configuration from the process arguments and environment.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    resolve_config(EngineConfig::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn layers_override_field_by_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"logLevel": "debug", "pulseMillis": 250, "queueHighWater": 10}}"#).unwrap();

        let cli = EngineConfig {
            config_path: Some(file.path().to_path_buf()),
            queue_high_water: Some(20),
            ..Default::default()
        };
        let config = resolve_config(cli).unwrap();

        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.pulse_millis, Some(250));
        assert_eq!(config.queue_high_water, Some(20));
        assert_eq!(config.idle_timeout_seconds, Some(300));

        let settings = config.context_settings().unwrap();
        assert_eq!(settings.pulse_period, Duration::from_millis(250));
        assert_eq!(settings.high_water, 20);
        assert_eq!(settings.owners.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn missing_file_is_an_empty_layer() {
        let dir = tempfile::tempdir().unwrap();
        let cli = EngineConfig {
            config_path: Some(dir.path().join("absent.conf")),
            ..Default::default()
        };
        let config = resolve_config(cli).unwrap();
        assert_eq!(config.log_dir(), PathBuf::from("./logs"));
        assert_eq!(config.monitor_interval(), Duration::from_secs(30));
    }

    #[test]
    fn malformed_file_and_zero_periods_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = read_config_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let config = EngineConfig {
            pulse_millis: Some(0),
            ..EngineConfig::defaults()
        };
        assert!(matches!(
            config.context_settings(),
            Err(ConfigError::Invalid { name: "pulseMillis", .. })
        ));
    }
}
