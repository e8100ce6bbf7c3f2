//! Configuration loading and validation.
//!
//! The configuration is a TOML document passed via `-c <path>`. Keys are
//! matched case-insensitively. The file mirrors the struct hierarchy:
//!
//! ```toml
//! [broker]
//! device = "/dev/ttyAMA0"
//! baudrate = 115200
//! socket = "/run/koruza.sock"
//!
//! [broker.hooks]
//! reset = "/usr/libexec/koruza/reset-device"   # optional
//!
//! [logging]
//! level = "info"
//! ```
//!
//! `device`, `baudrate` and `socket` are required; a missing key or a type
//! mismatch aborts startup with a descriptive message. `baudrate` must be
//! one of the discrete rates the serial layer supports.

use serde::Deserialize;
use thiserror::Error;

use crate::serial;

/// Structural failure while reading or parsing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker subtree: the serial device and the client socket.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Path to the serial device node.
    pub device: String,
    /// Line rate; one of the discrete rates accepted by the device layer.
    pub baudrate: u32,
    /// Filesystem path for the client listener socket.
    pub socket: String,
    /// External recovery hooks.
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// Paths of external executables the broker may invoke.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooksConfig {
    /// Executable run between closing and reopening the serial device
    /// during reset, typically a power-cycle script.
    pub reset: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Read and parse the configuration file at `path`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a configuration document. Keys are folded to lowercase first
    /// so `Device`, `DEVICE` and `device` all resolve to the same field.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let value: toml::Value = toml::from_str(content)?;
        lowercase_keys(value).try_into()
    }

    /// Semantic validation beyond what deserialization enforces. Returns
    /// one message per problem; an empty vec means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.broker.device.is_empty() {
            errors.push("broker.device must not be empty".to_string());
        }
        if self.broker.socket.is_empty() {
            errors.push("broker.socket must not be empty".to_string());
        }
        if serial::baud_constant(self.broker.baudrate).is_none() {
            errors.push(format!(
                "broker.baudrate {} is not a supported rate",
                self.broker.baudrate
            ));
        }
        if let Some(reset) = &self.broker.hooks.reset {
            if reset.is_empty() {
                errors.push("broker.hooks.reset must not be empty when set".to_string());
            }
        }

        errors
    }
}

fn lowercase_keys(value: toml::Value) -> toml::Value {
    match value {
        toml::Value::Table(table) => toml::Value::Table(
            table
                .into_iter()
                .map(|(key, value)| (key.to_lowercase(), lowercase_keys(value)))
                .collect(),
        ),
        toml::Value::Array(items) => {
            toml::Value::Array(items.into_iter().map(lowercase_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [broker]
        device = "/dev/ttyAMA0"
        baudrate = 115200
        socket = "/run/koruza.sock"

        [broker.hooks]
        reset = "/usr/libexec/koruza/reset-device"

        [logging]
        level = "debug"
    "#;

    #[test]
    fn test_parse_full_document() {
        let config = Config::parse(FULL).expect("parse");
        assert_eq!(config.broker.device, "/dev/ttyAMA0");
        assert_eq!(config.broker.baudrate, 115200);
        assert_eq!(config.broker.socket, "/run/koruza.sock");
        assert_eq!(
            config.broker.hooks.reset.as_deref(),
            Some("/usr/libexec/koruza/reset-device")
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let config = Config::parse(
            r#"
            [BROKER]
            Device = "/dev/ttyS0"
            BAUDRATE = 9600
            Socket = "/tmp/koruza.sock"
        "#,
        )
        .expect("parse");
        assert_eq!(config.broker.device, "/dev/ttyS0");
        assert_eq!(config.broker.baudrate, 9600);
    }

    #[test]
    fn test_missing_required_key_fails() {
        let err = Config::parse(
            r#"
            [broker]
            device = "/dev/ttyS0"
            socket = "/tmp/koruza.sock"
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("baudrate"));
    }

    #[test]
    fn test_type_mismatch_fails() {
        assert!(Config::parse(
            r#"
            [broker]
            device = "/dev/ttyS0"
            baudrate = "fast"
            socket = "/tmp/koruza.sock"
        "#,
        )
        .is_err());
    }

    #[test]
    fn test_hooks_and_logging_are_optional() {
        let config = Config::parse(
            r#"
            [broker]
            device = "/dev/ttyS0"
            baudrate = 57600
            socket = "/tmp/koruza.sock"
        "#,
        )
        .expect("parse");
        assert!(config.broker.hooks.reset.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_unsupported_baud() {
        let config = Config::parse(
            r#"
            [broker]
            device = "/dev/ttyS0"
            baudrate = 12345
            socket = "/tmp/koruza.sock"
        "#,
        )
        .expect("parse");
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("12345"));
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let config = Config::parse(
            r#"
            [broker]
            device = ""
            baudrate = 115200
            socket = ""
        "#,
        )
        .expect("parse");
        assert_eq!(config.validate().len(), 2);
    }
}
