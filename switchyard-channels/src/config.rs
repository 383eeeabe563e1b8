//! Configuration management with hierarchical overrides using figment.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables (`SWITCHYARD_*`, `__` separates nested keys)
//! 2. Explicit configuration file passed to [`ConfigLoader::with_file`]
//! 3. User configuration file (~/.config/switchyard/config.toml)
//! 4. System configuration file (/etc/switchyard/config.toml)
//! 5. Embedded defaults (lowest precedence)
//!
//! Command-line flags are applied by the caller on top of the loaded value.

use crate::codec::WireFormat;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A source could not be parsed or extracted.
    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),

    /// The merged configuration failed validation.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// What was wrong.
        message: String,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::InvalidFormat(Box::new(err))
    }
}

/// Top-level configuration for Switchyard components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Socket connection settings
    pub socket: SocketConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Socket construction settings.
///
/// Everything the multiplexer needs to open, keep alive and re-open its
/// transport. Timing values are plain milliseconds so they read naturally in
/// TOML and environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    /// Socket endpoint, e.g. `ws://localhost:4000/socket`
    pub url: String,
    /// Query parameters sent with the connect request (e.g. `token`)
    pub params: BTreeMap<String, String>,
    /// Interval between heartbeats while the connection is open
    pub heartbeat_interval_ms: u64,
    /// Heartbeat intervals without inbound traffic before the connection is
    /// considered half-open and forcibly re-established
    pub heartbeat_max_missed: u32,
    /// Backoff policy for reconnects and channel rejoins
    pub reconnect_backoff: BackoffConfig,
    /// Deadline for a join reply
    pub join_timeout_ms: u64,
    /// Default deadline for push and leave replies
    pub push_timeout_ms: u64,
    /// Deadline for opening the transport
    pub connect_timeout_ms: u64,
    /// Envelope encoding on the wire
    pub wire_format: WireFormat,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay
    pub base_ms: u64,
    /// Upper bound for any single delay
    pub max_ms: u64,
    /// Fraction of the nominal delay added as random jitter (0.0 to 1.0)
    pub jitter_ratio: f64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Log format (json, human)
    pub format: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/socket".to_owned(),
            params: BTreeMap::new(),
            heartbeat_interval_ms: 30_000,
            heartbeat_max_missed: 2,
            reconnect_backoff: BackoffConfig::default(),
            join_timeout_ms: 10_000,
            push_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            wire_format: WireFormat::V2,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 10_000,
            jitter_ratio: 0.25,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
        }
    }
}

impl SocketConfig {
    /// Create a configuration for `url` with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Add a connect parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Heartbeat interval as a [`Duration`].
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Join deadline as a [`Duration`].
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Default push deadline as a [`Duration`].
    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// Connect deadline as a [`Duration`].
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the settings for values the socket cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(invalid("url must not be empty"));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(invalid(format!(
                "url must use the ws:// or wss:// scheme, got '{url}'"
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms must be greater than 0"));
        }
        if self.heartbeat_max_missed == 0 {
            return Err(invalid("heartbeat_max_missed must be greater than 0"));
        }
        if self.join_timeout_ms == 0 {
            return Err(invalid("join_timeout_ms must be greater than 0"));
        }
        if self.push_timeout_ms == 0 {
            return Err(invalid("push_timeout_ms must be greater than 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be greater than 0"));
        }
        self.reconnect_backoff.validate()
    }
}

impl BackoffConfig {
    /// Check the backoff curve parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ms == 0 {
            return Err(invalid("reconnect_backoff.base_ms must be greater than 0"));
        }
        if self.max_ms < self.base_ms {
            return Err(invalid(
                "reconnect_backoff.max_ms must be greater than or equal to base_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(invalid(
                "reconnect_backoff.jitter_ratio must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    file: Option<PathBuf>,
    use_system_files: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    ///
    /// The component name determines the environment prefix: `switchyard`
    /// reads `SWITCHYARD_*`.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            file: None,
            use_system_files: true,
        }
    }

    /// Merge an explicit TOML file after the system and user files.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skip `/etc` and user config files (tests, sandboxed runs).
    #[must_use]
    pub const fn without_system_files(mut self) -> Self {
        self.use_system_files = false;
        self
    }

    /// Load configuration with hierarchical overrides using figment.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let config: Config = self.figment().extract()?;

        Self::validate_config(&config)?;

        Ok(config)
    }

    fn figment(&self) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if self.use_system_files {
            let system_config_path = "/etc/switchyard/config.toml";
            if std::path::Path::new(system_config_path).exists() {
                figment = figment.merge(Toml::file(system_config_path));
            }

            if let Some(user_config_path) = Self::user_config_path()
                && user_config_path.exists()
            {
                figment = figment.merge(Toml::file(&user_config_path));
            }
        }

        if let Some(ref path) = self.file {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(
            Env::prefixed(&format!(
                "{}_",
                self.component.replace('-', "_").to_uppercase()
            ))
            .split("__"),
        )
    }

    /// Get the user configuration file path using platform-aware directory lookup.
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("switchyard").join("config.toml"))
    }

    /// Validate the final configuration.
    fn validate_config(config: &Config) -> Result<(), ConfigError> {
        config.socket.validate()?;

        match config.logging.format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(invalid(format!(
                "logging.format must be 'human' or 'json', got '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_loader_defaults() {
        let config = ConfigLoader::new("switchyard-config-test-defaults")
            .without_system_files()
            .load()
            .expect("Failed to load config in test");

        assert_eq!(config.socket.url, "ws://localhost:4000/socket");
        assert_eq!(config.socket.heartbeat_interval_ms, 30_000);
        assert_eq!(config.socket.join_timeout_ms, 10_000);
        assert_eq!(config.socket.wire_format, WireFormat::V2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_loader_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[socket]
url = "wss://chat.example.com/socket"
join_timeout_ms = 2500

[socket.params]
token = "abc123"

[socket.reconnect_backoff]
base_ms = 100
max_ms = 2000
jitter_ratio = 0.5

[logging]
level = "debug"
format = "json"
"#
        )
        .expect("write config");

        let config = ConfigLoader::new("switchyard-config-test-file")
            .without_system_files()
            .with_file(file.path())
            .load()
            .expect("Failed to load config from file");

        assert_eq!(config.socket.url, "wss://chat.example.com/socket");
        assert_eq!(config.socket.join_timeout_ms, 2500);
        assert_eq!(
            config.socket.params.get("token").map(String::as_str),
            Some("abc123")
        );
        assert_eq!(config.socket.reconnect_backoff.base_ms, 100);
        assert_eq!(config.socket.reconnect_backoff.max_ms, 2000);
        // Untouched keys keep their defaults
        assert_eq!(config.socket.heartbeat_interval_ms, 30_000);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_config_loader_rejects_invalid_file_values() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[socket.reconnect_backoff]
base_ms = 5000
max_ms = 100
"#
        )
        .expect("write config");

        let result = ConfigLoader::new("switchyard-config-test-invalid")
            .without_system_files()
            .with_file(file.path())
            .load();

        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_socket_config_validation() {
        assert!(SocketConfig::default().validate().is_ok());

        let mut config = SocketConfig::new("http://localhost:4000/socket");
        assert!(config.validate().is_err());

        config = SocketConfig::new("");
        assert!(config.validate().is_err());

        config = SocketConfig::default();
        config.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());

        config = SocketConfig::default();
        config.reconnect_backoff.jitter_ratio = 1.5;
        assert!(config.validate().is_err());

        config = SocketConfig::default();
        config.join_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_param_builder() {
        let config = SocketConfig::new("ws://localhost:4000/socket")
            .with_param("token", "secret")
            .with_param("client", "cli");

        assert_eq!(config.params.len(), 2);
        assert_eq!(
            config.params.get("token").map(String::as_str),
            Some("secret")
        );
    }

    #[test]
    fn test_config_error_display() {
        let error = invalid("test error");
        assert_eq!(
            error.to_string(),
            "Configuration validation failed: test error"
        );
    }

    #[test]
    fn test_config_toml_serialization() {
        let config = Config::default();
        let toml = toml::to_string(&config).expect("Failed to serialize config to TOML in test");
        let deserialized: Config =
            toml::from_str(&toml).expect("Failed to deserialize config from TOML in test");
        assert_eq!(config, deserialized);
    }
}
