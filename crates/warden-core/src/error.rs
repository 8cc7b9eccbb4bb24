//! Error types for the IPsec agent

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failures while loading a configuration. Always fatal to the startup attempt.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    MissingFile { path: String },

    #[error("Failed to parse configuration: {reason}")]
    ParseFailure { reason: String },

    #[error("Invalid configuration: {reason}")]
    ValidationFailure { reason: String },
}

impl ConfigError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseFailure {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationFailure { .. })
    }
}

/// Failures raised by a platform backend. Recoverable at the engine level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend command not found: {command}")]
    CommandMissing { command: String },

    #[error("Backend command failed: {detail}")]
    CommandFailed { detail: String },

    #[error("Backend {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Malformed backend output: {detail}")]
    MalformedOutput { detail: String },
}

impl BackendError {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::CommandFailed {
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedOutput {
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
