//! Configuration
//!
//! Loaded from a TOML file with `MAILHUB_*` environment variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Hub and per-connection limits
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound queue slots per connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Idle time before the writer sends a keepalive ping
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Coordinator command queue slots
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,

    /// Largest inbound frame accepted from a client (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_command_buffer() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            keepalive_interval_secs: default_keepalive_interval(),
            command_buffer: default_command_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl HubConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment variable overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a file, then apply environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MAILHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MAILHUB_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(capacity) = lookup("MAILHUB_QUEUE_CAPACITY").and_then(|c| c.parse().ok()) {
            self.hub.queue_capacity = capacity;
        }
        if let Some(secs) = lookup("MAILHUB_KEEPALIVE_SECS").and_then(|s| s.parse().ok()) {
            self.hub.keepalive_interval_secs = secs;
        }
        if let Some(level) = lookup("MAILHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("MAILHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject values outside the supported ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(10..=300).contains(&self.hub.keepalive_interval_secs) {
            return Err(ConfigError::Invalid {
                field: "hub.keepalive_interval_secs",
                reason: format!("{} is outside 10..=300", self.hub.keepalive_interval_secs),
            });
        }
        if !(1024..=10 * 1024 * 1024).contains(&self.hub.max_message_size) {
            return Err(ConfigError::Invalid {
                field: "hub.max_message_size",
                reason: format!("{} is outside 1 KiB..=10 MiB", self.hub.max_message_size),
            });
        }
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "hub.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.hub.command_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "hub.command_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid {
                field: "logging.format",
                reason: format!("unknown format '{}'", self.logging.format),
            });
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.hub.queue_capacity, 256);
        assert_eq!(config.hub.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.server.bind_addr(), "127.0.0.1:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[hub]
queue_capacity = 64
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.hub.queue_capacity, 64);
        assert_eq!(config.hub.keepalive_interval_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_bad_keepalive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hub]\nkeepalive_interval_secs = 5").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "hub.keepalive_interval_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/mailhub.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hub\nqueue_capacity = ").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MAILHUB_PORT", "7000"),
            ("MAILHUB_QUEUE_CAPACITY", "not-a-number"),
            ("MAILHUB_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7000);
        // Unparseable values are ignored
        assert_eq!(config.hub.queue_capacity, 256);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
