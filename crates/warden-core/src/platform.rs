//! Platform backend contract
//!
//! One implementation exists per target platform. The reconciliation engine
//! only ever sees `Arc<dyn IpsecBackend>`.

use crate::agent::ObservedState;
use crate::config::AgentConfiguration;
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use std::fmt;

/// Programs the host's IPsec stack.
///
/// Implementations must tolerate calls from more than one task; the engine
/// serializes them, but a backend must not rely on that for memory safety.
#[async_trait]
pub trait IpsecBackend: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Program every connection in `config`.
    ///
    /// Re-applying an unchanged configuration must not duplicate policy
    /// objects. Returns `Err` only when no connection could be applied;
    /// partial success is an `Ok` report listing the failures.
    async fn apply_policy(&self, config: &AgentConfiguration) -> BackendResult<ApplyReport>;

    /// Query the link state. An `Err` means the state could not be determined.
    async fn check_status(&self) -> BackendResult<ObservedState>;

    /// Remove every policy object this agent created. A no-op when nothing was applied.
    async fn cleanup(&self) -> BackendResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailure {
    pub connection: String,
    pub error: BackendError,
}

/// Outcome of one `apply_policy` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub failed: Vec<ConnectionFailure>,
}

impl ApplyReport {
    pub fn record_success(&mut self, connection: impl Into<String>) {
        self.applied.push(connection.into());
    }

    pub fn record_failure(&mut self, connection: impl Into<String>, error: BackendError) {
        self.failed.push(ConnectionFailure {
            connection: connection.into(),
            error,
        });
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_partial(&self) -> bool {
        !self.applied.is_empty() && !self.failed.is_empty()
    }

    /// `Ok` when at least one connection was applied. A single failure is
    /// returned as-is so its kind (e.g. `Timeout`) survives.
    pub fn into_result(mut self) -> BackendResult<Self> {
        if !self.applied.is_empty() || self.failed.is_empty() {
            return Ok(self);
        }

        if self.failed.len() == 1 {
            return Err(self.failed.remove(0).error);
        }

        let detail = self
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.connection, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(BackendError::failed(format!(
            "all {} connections failed: {detail}",
            self.failed.len()
        )))
    }
}
