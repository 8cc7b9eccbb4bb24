//! # Warden Core
//!
//! Core types and traits for the ipsec-warden host agent.
//!
//! ## Contents
//! - Configuration model with load-time validation (JSON or YAML)
//! - Connection policy types handed to platform backends
//! - The backend capability contract and its error taxonomy
//! - Agent lifecycle state shared by the engine and the health endpoint

pub mod agent;
pub mod config;
pub mod error;
pub mod loader;
pub mod platform;
pub mod policy;

pub use agent::{AgentState, ObservedState};
pub use config::{AgentConfiguration, LogLevel, LogSink, RawConfig};
pub use error::{BackendError, BackendResult, ConfigError, Result};
pub use loader::{load, load_str, ConfigFormat};
pub use platform::{ApplyReport, ConnectionFailure, IpsecBackend};
pub use policy::{
    AuthCredential, AuthKind, Connection, CryptoProposal, IkeVersion, IpsecMode, RawConnection,
    TrafficSelector,
};

/// Current version for compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information for logs and the CLI
pub const BUILD_INFO: &str = concat!(
    "ipsec-warden ",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_NAME"),
    ")"
);

/// HTTP paths served by the agent
pub mod endpoints {
    pub const STATUS: &str = "/status";
}
