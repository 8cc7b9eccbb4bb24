//! External-script backend
//!
//! Drives the host IPsec stack through three scripts (`apply`, `status`,
//! `cleanup`) living in one directory. On Windows they are PowerShell scripts
//! invoked as `powershell -ExecutionPolicy Bypass -File apply.ps1 -Key Value`;
//! elsewhere they are shell scripts invoked as `sh apply.sh --key value`.

use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};
use warden_core::{
    AgentConfiguration, ApplyReport, BackendError, BackendResult, Connection, IpsecBackend,
    ObservedState,
};

use crate::crypto::NativeCrypto;

pub const APPLY: &str = "apply";
pub const STATUS: &str = "status";
pub const CLEANUP: &str = "cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavor {
    PowerShell,
    Shell,
}

impl ScriptFlavor {
    pub fn for_host() -> Self {
        if cfg!(windows) {
            ScriptFlavor::PowerShell
        } else {
            ScriptFlavor::Shell
        }
    }

    pub fn interpreter(&self) -> &'static str {
        match self {
            ScriptFlavor::PowerShell => "powershell",
            ScriptFlavor::Shell => "sh",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ScriptFlavor::PowerShell => "ps1",
            ScriptFlavor::Shell => "sh",
        }
    }

    fn command(&self, script: &Path, args: &[(&'static str, String)]) -> Command {
        let mut cmd = Command::new(self.interpreter());
        match self {
            ScriptFlavor::PowerShell => {
                cmd.args(["-ExecutionPolicy", "Bypass", "-File"]).arg(script);
                for (key, value) in args {
                    cmd.arg(format!("-{key}")).arg(value);
                }
            }
            ScriptFlavor::Shell => {
                cmd.arg(script);
                for (key, value) in args {
                    cmd.arg(format!("--{}", kebab_case(key))).arg(value);
                }
            }
        }
        cmd
    }
}

/// What a script printed on success.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutput {
    Json(Value),
    Text(String),
}

impl ScriptOutput {
    /// stdout that looks like a JSON object is parsed; anything else is kept as text.
    pub fn sniff(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return ScriptOutput::Json(value);
            }
        }
        ScriptOutput::Text(trimmed.to_string())
    }

    fn status_field(&self) -> Option<&str> {
        match self {
            ScriptOutput::Json(value) => value.get("status").and_then(Value::as_str),
            ScriptOutput::Text(_) => None,
        }
    }

    /// Scripts may exit 0 yet report `{"status": "ERROR", "error": ...}`.
    pub fn into_success(self) -> BackendResult<Self> {
        if self
            .status_field()
            .is_some_and(|s| s.eq_ignore_ascii_case("ERROR"))
        {
            let detail = match &self {
                ScriptOutput::Json(value) => value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("script reported an error")
                    .to_string(),
                ScriptOutput::Text(text) => text.clone(),
            };
            return Err(BackendError::failed(detail));
        }
        Ok(self)
    }

    pub fn observed_state(self) -> BackendResult<ObservedState> {
        let output = self.into_success()?;
        let status = match &output {
            ScriptOutput::Json(_) => output.status_field().unwrap_or_default(),
            ScriptOutput::Text(text) => text.as_str(),
        };
        status
            .parse::<ObservedState>()
            .map_err(|e| BackendError::malformed(format!("status script: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct ScriptBackend {
    flavor: ScriptFlavor,
    scripts_dir: PathBuf,
    timeout: Duration,
}

impl ScriptBackend {
    pub fn new(flavor: ScriptFlavor, scripts_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let backend = Self {
            flavor,
            scripts_dir: scripts_dir.into(),
            timeout,
        };
        backend.warn_if_unprivileged();
        backend
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn script_path(&self, script: &str) -> PathBuf {
        self.scripts_dir
            .join(format!("{script}.{}", self.flavor.extension()))
    }

    fn warn_if_unprivileged(&self) {
        match crate::host::is_elevated() {
            Some(true) => {}
            Some(false) => {
                warn!("Agent is not running with administrative privileges; IPsec policy application will likely fail")
            }
            None => debug!("Could not verify administrative privileges on this host"),
        }
    }

    /// Run one script, bounded by the configured timeout.
    #[instrument(skip(self, args), fields(flavor = ?self.flavor))]
    pub async fn run(
        &self,
        script: &'static str,
        args: &[(&'static str, String)],
    ) -> BackendResult<ScriptOutput> {
        let path = self.script_path(script);
        if !path.exists() {
            error!("Script not found: {}", path.display());
            return Err(BackendError::CommandMissing {
                command: path.display().to_string(),
            });
        }

        let mut cmd = self.flavor.command(&path, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackendError::CommandMissing {
                command: self.flavor.interpreter().to_string(),
            },
            _ => BackendError::failed(format!("failed to spawn {script}: {e}")),
        })?;

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| BackendError::failed(format!("{script}: {e}")))?
            }
            Err(_) => {
                error!("Script execution timed out: {}", path.display());
                return Err(BackendError::Timeout {
                    operation: script,
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("Script error ({}): {}", script, stderr);
            let detail = if stderr.is_empty() {
                format!("{script} exited with {}", output.status)
            } else {
                stderr
            };
            return Err(BackendError::failed(detail));
        }

        Ok(ScriptOutput::sniff(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Arguments passed to the apply script for one connection.
///
/// The native tooling takes one subnet per side, so only the first of each list is used.
pub fn connection_args(conn: &Connection) -> Vec<(&'static str, String)> {
    let crypto = NativeCrypto::from_proposal(&conn.crypto.ike);
    let first = |subnets: &[ipnet::IpNet]| {
        subnets
            .first()
            .map(ToString::to_string)
            .unwrap_or_default()
    };

    vec![
        ("ConnectionName", conn.name.clone()),
        ("LocalSubnet", first(&conn.local_subnets)),
        ("RemoteSubnet", first(&conn.remote_subnets)),
        ("PresharedKey", conn.auth.secret.clone()),
        ("Mode", conn.mode.native_name().to_string()),
        ("Protocol", capitalize(&conn.selector.protocol)),
        ("LocalPort", capitalize(&conn.selector.local_port)),
        ("RemotePort", capitalize(&conn.selector.remote_port)),
        ("Encryption", crypto.encryption.to_string()),
        ("Hash", crypto.hash.to_string()),
        ("DHGroup", crypto.dh_group.to_string()),
        ("EspProposal", conn.crypto.esp.clone()),
        ("LifetimeMinutes", conn.lifetime_minutes.to_string()),
    ]
}

/// `tcp` -> `Tcp`, `ANY` -> `Any`, `443` -> `443`.
fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// `DHGroup` -> `dh-group`, `LocalSubnet` -> `local-subnet`.
fn kebab_case(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev_lower = chars[i - 1].is_ascii_lowercase();
            let next_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if prev_lower || (chars[i - 1].is_ascii_uppercase() && next_lower) {
                out.push('-');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

#[async_trait]
impl IpsecBackend for ScriptBackend {
    fn name(&self) -> &'static str {
        match self.flavor {
            ScriptFlavor::PowerShell => "windows-native",
            ScriptFlavor::Shell => "shell-script",
        }
    }

    #[instrument(skip(self, config), fields(backend = self.name()))]
    async fn apply_policy(&self, config: &AgentConfiguration) -> BackendResult<ApplyReport> {
        info!("Applying IPsec policies ({})...", self.name());

        // Start from a clean slate so re-applying never duplicates rules.
        if let Err(e) = self.cleanup().await {
            warn!("Pre-apply cleanup failed: {}", e);
        }

        let mut report = ApplyReport::default();
        for conn in config.connections() {
            info!("Applying connection: {}", conn.name);
            let args = connection_args(conn);
            match self
                .run(APPLY, &args)
                .await
                .and_then(ScriptOutput::into_success)
            {
                Ok(_) => {
                    info!("Policy {} applied successfully", conn.name);
                    report.record_success(&conn.name);
                }
                Err(e) => {
                    error!("Failed to apply policy {}: {}", conn.name, e);
                    report.record_failure(&conn.name, e);
                }
            }
        }

        if report.is_partial() {
            warn!(
                "Some policies failed to apply ({} of {})",
                report.failed.len(),
                config.connections().len()
            );
        }
        report.into_result()
    }

    async fn check_status(&self) -> BackendResult<ObservedState> {
        self.run(STATUS, &[]).await?.observed_state()
    }

    async fn cleanup(&self) -> BackendResult<()> {
        info!("Cleaning up policies ({})...", self.name());
        self.run(CLEANUP, &[]).await?.into_success()?;
        Ok(())
    }
}
