//! Agent configuration model
//!
//! [`RawConfig`] mirrors the on-disk document. [`AgentConfiguration`] is the
//! validated, immutable snapshot handed to the engine; the only way to obtain
//! one is [`RawConfig::validate`], which either accepts every connection or
//! rejects the whole document.

use crate::error::{ConfigError, Result};
use crate::policy::{Connection, RawConnection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LOG_FILE: &str = "agent.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    File,
    Syslog,
    Stdout,
}

impl FromStr for LogSink {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(LogSink::File),
            "syslog" => Ok(LogSink::Syslog),
            "stdout" | "console" => Ok(LogSink::Stdout),
            _ => Err(format!(
                "invalid logging_type '{s}', must be 'file', 'syslog' or 'stdout'"
            )),
        }
    }
}

impl fmt::Display for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::File => f.write_str("file"),
            LogSink::Syslog => f.write_str("syslog"),
            LogSink::Stdout => f.write_str("stdout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            _ => Err(format!("invalid logging_level '{s}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

/// The configuration document as written on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub connections: Vec<RawConnection>,
    #[serde(default = "default_log_level")]
    pub logging_level: String,
    #[serde(default = "default_log_type")]
    pub logging_type: String,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default)]
    pub api_port: Option<i64>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_type() -> String {
    "file".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE)
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

impl RawConfig {
    /// Validates the whole document. Every defect is reported in a single
    /// `ValidationFailure`; no partially valid configuration is returned.
    pub fn validate(&self) -> Result<AgentConfiguration> {
        let mut defects = Vec::new();

        if self.connections.is_empty() {
            defects.push("at least one connection must be defined".to_string());
        }

        let mut connections = Vec::with_capacity(self.connections.len());
        for (index, raw) in self.connections.iter().enumerate() {
            match raw.validate() {
                Ok(conn) => connections.push(conn),
                Err(errors) => {
                    let label = raw.label(index);
                    defects.extend(errors.into_iter().map(|e| format!("{label}: {e}")));
                }
            }
        }

        let log_level = self
            .logging_level
            .parse::<LogLevel>()
            .map_err(|e| defects.push(e))
            .ok();
        let log_sink = self
            .logging_type
            .parse::<LogSink>()
            .map_err(|e| defects.push(e))
            .ok();

        let health_api_port = match self.api_port {
            None => None,
            Some(port) => match u16::try_from(port) {
                Ok(port) if port > 0 => Some(port),
                _ => {
                    defects.push(format!("api_port must be between 1 and 65535, got {port}"));
                    None
                }
            },
        };

        if self.poll_interval_secs == 0 {
            defects.push("poll_interval_secs must be greater than zero".to_string());
        }
        if self.command_timeout_secs == 0 {
            defects.push("command_timeout_secs must be greater than zero".to_string());
        }

        if !defects.is_empty() {
            return Err(ConfigError::validation(defects.join("; ")));
        }

        let (Some(log_level), Some(log_sink)) = (log_level, log_sink) else {
            return Err(ConfigError::validation("invalid logging settings"));
        };

        Ok(AgentConfiguration {
            connections,
            log_level,
            log_sink,
            log_file: self.log_file.clone(),
            health_api_port,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            scripts_dir: self.scripts_dir.clone(),
        })
    }
}

/// Validated agent configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfiguration {
    connections: Vec<Connection>,
    log_level: LogLevel,
    log_sink: LogSink,
    log_file: PathBuf,
    health_api_port: Option<u16>,
    poll_interval: Duration,
    command_timeout: Duration,
    scripts_dir: Option<PathBuf>,
}

impl AgentConfiguration {
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn log_sink(&self) -> LogSink {
        self.log_sink
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn health_api_port(&self) -> Option<u16> {
        self.health_api_port
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn scripts_dir(&self) -> Option<&Path> {
        self.scripts_dir.as_deref()
    }

    /// Names declared by more than one connection, each listed once.
    ///
    /// Duplicates are accepted; callers decide how to report them since no
    /// log sink may exist yet while a configuration is being loaded.
    pub fn duplicate_names(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut repeated = BTreeSet::new();
        for conn in &self.connections {
            if !seen.insert(conn.name.as_str()) {
                repeated.insert(conn.name.as_str());
            }
        }
        repeated.into_iter().collect()
    }

    /// One line per connection, for operator output.
    pub fn summary(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|c| {
                format!(
                    "{} [{} / ikev2] {} <-> {} ike={} esp={} lifetime={}m",
                    c.name,
                    c.mode,
                    join(&c.local_subnets),
                    join(&c.remote_subnets),
                    c.crypto.ike,
                    c.crypto.esp,
                    c.lifetime_minutes
                )
            })
            .collect()
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
