//! # Warden Engine
//!
//! Reconciliation loop and health reporting for the ipsec-warden agent.

mod engine;
mod health;

pub use engine::{
    ConnectionOutcome, EngineEvent, EngineSettings, HealthSnapshot, ReconciliationEngine,
};
pub use health::HealthReporter;

// Re-export core types for convenience
pub use warden_core::{AgentConfiguration, AgentState, BackendError, IpsecBackend, ObservedState};
