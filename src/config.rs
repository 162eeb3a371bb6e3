//! Server configuration
//!
//! Three layers, later wins: built-in defaults, an optional TOML file, then
//! `STREAMHUB_*` environment variables. Durations use humantime syntax
//! (`"5m"`, `"250ms"`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::event_store::{EventStoreConfig, DEFAULT_QUEUE_CAPACITY};
use crate::hub::HubConfig;

pub use crate::hub::RedactionConfig;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "STREAMHUB_";

/// Drop records are kept at least this long
const MIN_DROPPED_RETENTION: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// HTTP bind address
    pub listen_addr: String,
    /// Root for the event log, pipeline state and exports
    pub data_dir: PathBuf,
    /// Open the SQLite event log; `false` runs memory-only
    pub event_log: bool,
    /// Refuse to start when the event log cannot be opened
    pub require_event_log: bool,
    pub buffer_size: usize,
    pub retention_seconds: u64,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    pub client_outbound_capacity: usize,
    pub broadcast_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dropped_event_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub drop_coalesce_window: Duration,
    pub replay_limit: usize,
    /// Event log writes that may queue before appends are discarded
    pub log_queue_capacity: usize,
    /// Defaults to `<data_dir>/pipelines`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_state_dir: Option<PathBuf>,
    /// Base for relative `workflow_file` paths
    pub workflow_dir: PathBuf,
    pub log_format: LogFormat,
    pub redaction: RedactionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7337".to_string(),
            data_dir: PathBuf::from("./data"),
            event_log: true,
            require_event_log: false,
            buffer_size: 10_000,
            retention_seconds: 3600,
            cleanup_interval: Duration::from_secs(300),
            client_outbound_capacity: 256,
            broadcast_capacity: 256,
            idle_timeout: Duration::from_secs(60),
            dropped_event_retention: MIN_DROPPED_RETENTION,
            drop_coalesce_window: Duration::from_millis(250),
            replay_limit: 1000,
            log_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pipeline_state_dir: None,
            workflow_dir: PathBuf::from("."),
            log_format: LogFormat::Text,
            redaction: RedactionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, then `path` (if any), then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `STREAMHUB_*` overrides from `vars`
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "LISTEN_ADDR" => self.listen_addr = value,
                "DATA_DIR" => self.data_dir = PathBuf::from(value),
                "EVENT_LOG" => self.event_log = parse_bool(&key, &value)?,
                "REQUIRE_EVENT_LOG" => self.require_event_log = parse_bool(&key, &value)?,
                "BUFFER_SIZE" => self.buffer_size = parse(&key, &value)?,
                "RETENTION_SECONDS" => self.retention_seconds = parse(&key, &value)?,
                "CLEANUP_INTERVAL" => self.cleanup_interval = parse_duration(&key, &value)?,
                "CLIENT_OUTBOUND_CAPACITY" => self.client_outbound_capacity = parse(&key, &value)?,
                "BROADCAST_CAPACITY" => self.broadcast_capacity = parse(&key, &value)?,
                "IDLE_TIMEOUT" => self.idle_timeout = parse_duration(&key, &value)?,
                "DROPPED_EVENT_RETENTION" => {
                    self.dropped_event_retention = parse_duration(&key, &value)?
                }
                "DROP_COALESCE_WINDOW" => self.drop_coalesce_window = parse_duration(&key, &value)?,
                "REPLAY_LIMIT" => self.replay_limit = parse(&key, &value)?,
                "LOG_QUEUE_CAPACITY" => self.log_queue_capacity = parse(&key, &value)?,
                "PIPELINE_STATE_DIR" => self.pipeline_state_dir = Some(PathBuf::from(value)),
                "WORKFLOW_DIR" => self.workflow_dir = PathBuf::from(value),
                "LOG_FORMAT" => self.log_format = parse(&key, &value)?,
                "REDACTION_ENABLED" => self.redaction.enabled = parse_bool(&key, &value)?,
                _ => debug!(key = %key, "ignoring unknown environment override"),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("buffer_size", self.buffer_size),
            ("client_outbound_capacity", self.client_outbound_capacity),
            ("broadcast_capacity", self.broadcast_capacity),
            ("replay_limit", self.replay_limit),
            ("log_queue_capacity", self.log_queue_capacity),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", key)));
            }
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle_timeout must be greater than 0".to_string()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must not be empty".to_string()));
        }
        crate::hub::Redactor::from_config(&self.redaction)
            .map_err(|e| ConfigError::Invalid(format!("redaction pattern: {}", e)))?;
        Ok(())
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join("events.db")
    }

    pub fn pipeline_state_dir(&self) -> PathBuf {
        self.pipeline_state_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("pipelines"))
    }

    pub fn store_config(&self) -> EventStoreConfig {
        EventStoreConfig {
            buffer_size: self.buffer_size,
            retention: Duration::from_secs(self.retention_seconds),
            dropped_retention: self.dropped_event_retention.max(MIN_DROPPED_RETENTION),
            default_limit: self.replay_limit,
            log_queue_capacity: self.log_queue_capacity,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            client_outbound_capacity: self.client_outbound_capacity,
            coalesce_window: self.drop_coalesce_window,
            replay_limit: self.replay_limit,
        }
    }
}

fn env_error(key: &str, value: &str) -> ConfigError {
    ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| env_error(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(env_error(key, value)),
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|_| env_error(key, value))
}
