//! Backend selection for the running host

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;
use warden_core::{AgentConfiguration, IpsecBackend};

use crate::memory::InMemoryBackend;
use crate::script::{ScriptBackend, ScriptFlavor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Script backend flavour matching the detected OS.
    #[default]
    Auto,
    Script,
    /// Simulated backend; touches nothing on the host.
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "script" => Ok(BackendKind::Script),
            "memory" | "dry-run" => Ok(BackendKind::Memory),
            other => Err(format!(
                "unknown backend '{other}', expected auto, script or memory"
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Auto => f.write_str("auto"),
            BackendKind::Script => f.write_str("script"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

/// Build the backend once at startup. `base_dir` is where `scripts/` is
/// looked up when the configuration does not name a scripts directory.
pub fn select_backend(
    kind: BackendKind,
    config: &AgentConfiguration,
    base_dir: &Path,
) -> Arc<dyn IpsecBackend> {
    let backend: Arc<dyn IpsecBackend> = match kind {
        BackendKind::Auto | BackendKind::Script => {
            let scripts_dir = config
                .scripts_dir()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base_dir.join("scripts"));
            Arc::new(ScriptBackend::new(
                ScriptFlavor::for_host(),
                scripts_dir,
                config.command_timeout(),
            ))
        }
        BackendKind::Memory => Arc::new(InMemoryBackend::new()),
    };

    info!(
        "Selected backend '{}' for {} ({})",
        backend.name(),
        std::env::consts::OS,
        kind
    );
    backend
}

/// Whether the process runs with administrative privileges, if that can be determined.
#[cfg(unix)]
pub fn is_elevated() -> Option<bool> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    Some(unsafe { libc::geteuid() } == 0)
}

#[cfg(not(unix))]
pub fn is_elevated() -> Option<bool> {
    None
}
