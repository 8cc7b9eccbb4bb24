//! # Warden Backends
//!
//! Platform implementations of [`warden_core::IpsecBackend`]:
//! - [`ScriptBackend`]: drives the host through `apply`/`status`/`cleanup`
//!   scripts (PowerShell on Windows, `sh` elsewhere)
//! - [`InMemoryBackend`]: simulated policy store for dry runs and tests
//!
//! [`select_backend`] picks one at startup from the detected OS.

pub mod crypto;
pub mod host;
pub mod memory;
pub mod script;

pub use crypto::NativeCrypto;
pub use host::{is_elevated, select_backend, BackendKind};
pub use memory::{BackendCall, InMemoryBackend};
pub use script::{ScriptBackend, ScriptFlavor, ScriptOutput};

// Re-export core types for convenience
pub use warden_core::{ApplyReport, BackendError, BackendResult, IpsecBackend, ObservedState};
