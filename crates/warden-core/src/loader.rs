//! Configuration loading
//!
//! Reads a JSON or YAML document, applies environment overrides and validates
//! it into an [`AgentConfiguration`].

use std::path::Path;

use tracing::{debug, info};

use crate::config::{AgentConfiguration, RawConfig};
use crate::error::{ConfigError, Result};

pub const ENV_LOG_LEVEL: &str = "WARDEN_LOG_LEVEL";
pub const ENV_API_PORT: &str = "WARDEN_API_PORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Format implied by the file extension, if any.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(ConfigFormat::Json),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            _ => None,
        }
    }
}

/// Load and validate a configuration file.
///
/// Environment variables:
/// - `WARDEN_LOG_LEVEL`: override `logging_level`
/// - `WARDEN_API_PORT`: override `api_port`
pub fn load(path: impl AsRef<Path>) -> Result<AgentConfiguration> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::MissingFile {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::parse(format!("failed to read {}: {e}", path.display())))?;

    let mut raw = parse_document(&contents, ConfigFormat::from_path(path))?;
    apply_overrides(&mut raw, |name| std::env::var(name).ok())?;

    let config = raw.validate()?;

    info!(
        "Configuration loaded: {} connection(s) from {}",
        config.connections().len(),
        path.display()
    );

    Ok(config)
}

/// Load and validate a configuration held in memory. No environment overrides.
pub fn load_str(contents: &str, format: Option<ConfigFormat>) -> Result<AgentConfiguration> {
    parse_document(contents, format)?.validate()
}

/// Parse without validating. `None` tries JSON first, then YAML.
pub fn parse_document(contents: &str, format: Option<ConfigFormat>) -> Result<RawConfig> {
    match format {
        Some(ConfigFormat::Json) => serde_json::from_str(contents)
            .map_err(|e| ConfigError::parse(format!("invalid JSON: {e}"))),
        Some(ConfigFormat::Yaml) => serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::parse(format!("invalid YAML: {e}"))),
        None => match serde_json::from_str(contents) {
            Ok(raw) => Ok(raw),
            Err(json_err) => {
                debug!("Not JSON ({json_err}), trying YAML");
                serde_yaml::from_str(contents).map_err(|yaml_err| {
                    ConfigError::parse(format!(
                        "could not parse config as JSON ({json_err}) or YAML ({yaml_err})"
                    ))
                })
            }
        },
    }
}

/// Apply overrides from `lookup` (normally the process environment) before validation.
pub fn apply_overrides<F>(raw: &mut RawConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        debug!("logging_level overridden to {}", level);
        raw.logging_level = level;
    }

    if let Some(port) = lookup(ENV_API_PORT) {
        let port = port.trim().parse::<i64>().map_err(|_| {
            ConfigError::validation(format!("{ENV_API_PORT}: invalid port '{port}'"))
        })?;
        debug!("api_port overridden to {}", port);
        raw.api_port = Some(port);
    }

    Ok(())
}
