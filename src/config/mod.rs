use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use toml::Value;

use crate::beanstalk::{
    ClientSettings, ConnectionSettings, DEFAULT_MAX_IDLE_CLIENTS, DEFAULT_MAX_IDLE_POLLS,
    DEFAULT_READ_POLL_INTERVAL_MS,
};
use crate::intake::{
    IntakePolicy, DEFAULT_MAX_MESSAGE_SIZE_BYTES, DEFAULT_SUBMISSION_TTR_SECONDS,
    DEFAULT_SUPPORTED_VERSION,
};
use crate::processing::{WorkerOptions, DEFAULT_RECONNECT_BACKOFF};
use crate::throttle::{
    ThrottlePolicy, DEFAULT_LOOKUP_FAILURE_WAIT_SECONDS, DEFAULT_THROTTLE_WINDOW_SECONDS,
};

pub const CONFIG_PATH_ENV: &str = "STATIK_REPORT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub io_threads: usize,
    pub read_timeout_seconds: u64,
    pub max_message_size_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 12345,
            io_threads: 2,
            read_timeout_seconds: 10,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub tube: String,
    pub processors: usize,
    pub reserve_timeout_seconds: Option<u32>,
    pub read_poll_interval_ms: u64,
    pub max_idle_polls: u32,
    pub pool_max_idle: usize,
    pub reconnect_backoff_ms: u64,
    pub bury_malformed: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 11300,
            tube: "processing".to_owned(),
            processors: 4,
            reserve_timeout_seconds: None,
            read_poll_interval_ms: DEFAULT_READ_POLL_INTERVAL_MS,
            max_idle_polls: DEFAULT_MAX_IDLE_POLLS,
            pool_max_idle: DEFAULT_MAX_IDLE_CLIENTS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF.as_millis() as u64,
            bury_malformed: false,
        }
    }
}

impl QueueConfig {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            host: self.host.clone(),
            port: self.port,
            tube: Some(self.tube.clone()),
            connection: ConnectionSettings {
                read_poll_interval: Duration::from_millis(self.read_poll_interval_ms),
                max_idle_polls: self.max_idle_polls,
            },
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            reserve_timeout_seconds: self.reserve_timeout_seconds,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            bury_malformed: self.bury_malformed,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntakeConfig {
    pub supported_version: i32,
    pub throttle_window_seconds: u64,
    pub lookup_failure_wait_seconds: u64,
    pub submission_ttr_seconds: u32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            supported_version: DEFAULT_SUPPORTED_VERSION,
            throttle_window_seconds: DEFAULT_THROTTLE_WINDOW_SECONDS,
            lookup_failure_wait_seconds: DEFAULT_LOOKUP_FAILURE_WAIT_SECONDS,
            submission_ttr_seconds: DEFAULT_SUBMISSION_TTR_SECONDS,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    #[serde(default = "default_storage_engine")]
    pub engine: String,
    #[serde(default = "default_storage_path")]
    pub path: String,
    pub database: String,
    #[serde(default)]
    pub sled: SledConfig,
    #[serde(default)]
    pub collections: CollectionsConfig,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectionsConfig {
    pub data: String,
    pub throttle: String,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            data: "data".to_owned(),
            throttle: "throttle".to_owned(),
        }
    }
}

fn default_storage_engine() -> String {
    "sled".to_owned()
}

fn default_storage_path() -> String {
    "~/.statik-report/data".to_owned()
}

impl AppConfig {
    /// Loads the config named by the first argument when it is not an
    /// override, else by `STATIK_REPORT_CONFIG`, else `./config.toml`. The
    /// remaining arguments are applied as overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<(PathBuf, Self), ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();
        let path = match args.first() {
            Some(first) if !first.starts_with("--") => PathBuf::from(args.remove(0)),
            _ => env::var_os(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        let config = Self::load_from_toml_with_args(&path, args)?;
        Ok((path, config))
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn intake_policy(&self) -> IntakePolicy {
        IntakePolicy {
            supported_version: self.intake.supported_version,
            throttle: ThrottlePolicy {
                window_seconds: self.intake.throttle_window_seconds,
                lookup_failure_wait_seconds: self.intake.lookup_failure_wait_seconds,
            },
            submission_ttr_seconds: self.intake.submission_ttr_seconds,
            max_message_size_bytes: self.server.max_message_size_bytes,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool, &str); 5] = [
            ("server.io_threads", self.server.io_threads > 0, "must be at least 1"),
            ("queue.processors", self.queue.processors > 0, "must be at least 1"),
            (
                "queue.read_poll_interval_ms",
                self.queue.read_poll_interval_ms > 0,
                "must be at least 1",
            ),
            ("queue.tube", !self.queue.tube.trim().is_empty(), "must not be empty"),
            (
                "storage.database",
                !self.storage.database.trim().is_empty(),
                "must not be empty",
            ),
        ];

        match checks.into_iter().find(|(_, ok, _)| !ok) {
            Some((key, _, reason)) => Err(ConfigError::InvalidSetting {
                key: key.to_owned(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: String,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(
                f,
                "unknown override key path '{key}'; only keys present in the config file can be overridden"
            ),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::TomlParse { source, .. } | Self::Deserialize(source) => Some(source),
            _ => None,
        }
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let key = match arg.strip_prefix("--") {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ => return Err(ConfigError::InvalidArgFormat { arg }),
        };

        let value = iter
            .next()
            .ok_or_else(|| ConfigError::MissingValueForArg { key: key.clone() })?;
        parsed.push((key, value));
    }

    Ok(parsed)
}

/// Replaces an existing scalar at a dotted path, parsing the raw text as the
/// type the file already holds there.
fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };
    let Some((sections, final_key)) = split_key_path(key_path) else {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    };

    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(final_key))
        .ok_or_else(unknown)?;
    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;

    Ok(())
}

fn split_key_path(key_path: &str) -> Option<(Vec<&str>, &str)> {
    let mut parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    let final_key = parts.pop()?;
    Some((parts, final_key))
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
