//! Daemon configuration with hierarchical overrides.
//!
//! Precedence, lowest to highest:
//! 1. Embedded defaults
//! 2. System configuration file (`/etc/vigil/config.toml`)
//! 3. User configuration file (`~/.config/vigil/config.toml`)
//! 4. An explicit `--config` file
//! 5. Environment variables (`VIGILD_*`, `__`-separated nesting)

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::SensorConfig;

/// System-wide configuration file location.
const SYSTEM_CONFIG_PATH: &str = "/etc/vigil/config.toml";

/// Configuration loading errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidFormat(#[from] figment::Error),
}

/// Full daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    /// Core capacities and timeouts.
    pub sensor: SensorConfig,
    /// Control and feed socket settings.
    pub control: ControlSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Socket endpoints and framing limits for the control surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Control command socket.
    pub socket_path: PathBuf,
    /// Event feed socket.
    pub feed_socket_path: PathBuf,
    /// Largest accepted frame on either socket.
    pub max_frame_bytes: usize,
    /// Reply/stream write timeout in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/vigil/control.sock"),
            feed_socket_path: PathBuf::from("/var/run/vigil/events.sock"),
            max_frame_bytes: 64 * 1024,
            write_timeout_ms: 5000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Initial log level (trace, debug, info, warn, error); adjustable at
    /// runtime through the control surface.
    pub level: String,
    /// Log format (json, human).
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
        }
    }
}

/// Hierarchical configuration loader.
pub struct ConfigLoader {
    override_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            override_path: None,
        }
    }

    /// Adds an explicit configuration file with precedence over the system
    /// and user files.
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.override_path = Some(path);
        self
    }

    /// Loads and merges every configuration source.
    ///
    /// # Errors
    ///
    /// Returns an error if any present source fails to parse or the merged
    /// result does not deserialize. Missing files are skipped.
    pub fn load(&self) -> Result<DaemonConfig, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(DaemonConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH));

        if let Some(user_config) = user_config_path() {
            figment = figment.merge(Toml::file(user_config));
        }
        if let Some(path) = &self.override_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("VIGILD_").split("__"));

        Ok(figment.extract()?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn user_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/vigil/config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_load_and_validate() {
        let config = DaemonConfig::default();
        config.sensor.validate().expect("default sensor config");
        assert_eq!(config.logging.level, "info");
        assert!(config.control.max_frame_bytes > 0);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        writeln!(
            file,
            "[sensor]\ncache_capacity = 4096\n\n[logging]\nlevel = \"debug\""
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .with_file(path)
            .load()
            .expect("load config");
        assert_eq!(config.sensor.cache_capacity, 4096);
        assert_eq!(config.logging.level, "debug");
        // Untouched sections keep their defaults.
        assert_eq!(config.sensor.notify_channel_capacity, 2048);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "sensor = {").expect("write config");

        let result = ConfigLoader::new().with_file(path).load();
        assert!(result.is_err());
    }
}
