//! In-memory backend
//!
//! Keeps the policy objects it "creates" in a set instead of touching the
//! host. Used for dry runs and as a scriptable stand-in in tests: status
//! observations can be queued, individual connections can be made to fail,
//! and every call is journaled.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info};
use warden_core::{
    AgentConfiguration, ApplyReport, BackendError, BackendResult, IpsecBackend, ObservedState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    Apply,
    Status,
    Cleanup,
}

#[derive(Debug, Default)]
struct MemoryState {
    policies: BTreeSet<String>,
    created_total: usize,
    observations: VecDeque<BackendResult<ObservedState>>,
    last_observation: Option<BackendResult<ObservedState>>,
    failing: HashSet<String>,
    journal: Vec<BackendCall>,
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    delay: Option<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue status observations. Once drained, the last one repeats.
    pub fn with_observations<I>(self, observations: I) -> Self
    where
        I: IntoIterator<Item = BackendResult<ObservedState>>,
    {
        self.state.lock().observations.extend(observations);
        self
    }

    /// Make every call take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make `apply_policy` fail for the named connection.
    pub fn fail_connection(&self, name: impl Into<String>) {
        self.state.lock().failing.insert(name.into());
    }

    pub fn push_observation(&self, observation: BackendResult<ObservedState>) {
        self.state.lock().observations.push_back(observation);
    }

    /// Distinct policy objects currently present.
    pub fn policies(&self) -> Vec<String> {
        self.state.lock().policies.iter().cloned().collect()
    }

    /// Policy objects created since construction, counting re-creations.
    pub fn created_total(&self) -> usize {
        self.state.lock().created_total
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().journal.clone()
    }

    pub fn count(&self, call: BackendCall) -> usize {
        self.state.lock().journal.iter().filter(|c| **c == call).count()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl IpsecBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply_policy(&self, config: &AgentConfiguration) -> BackendResult<ApplyReport> {
        self.pause().await;
        let mut state = self.state.lock();
        state.journal.push(BackendCall::Apply);

        let mut report = ApplyReport::default();
        let mut desired = BTreeSet::new();
        for conn in config.connections() {
            if state.failing.contains(&conn.name) {
                report.record_failure(
                    &conn.name,
                    BackendError::failed(format!("simulated failure for {}", conn.name)),
                );
                continue;
            }
            desired.extend(conn.policy_ids());
            report.record_success(&conn.name);
        }

        // Diff against what exists so re-applying creates nothing new.
        state.policies.retain(|id| desired.contains(id));
        for id in desired {
            if state.policies.insert(id) {
                state.created_total += 1;
            }
        }

        info!(
            "Simulated apply: {} connection(s), {} policy object(s)",
            report.applied_count(),
            state.policies.len()
        );
        report.into_result()
    }

    async fn check_status(&self) -> BackendResult<ObservedState> {
        self.pause().await;
        let mut state = self.state.lock();
        state.journal.push(BackendCall::Status);

        let observation = match state.observations.pop_front() {
            Some(next) => {
                state.last_observation = Some(next.clone());
                next
            }
            None => match &state.last_observation {
                Some(last) => last.clone(),
                None if state.policies.is_empty() => Ok(ObservedState::Disconnected),
                None => Ok(ObservedState::Connected),
            },
        };
        debug!("Simulated status: {:?}", observation);
        observation
    }

    async fn cleanup(&self) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.state.lock();
        state.journal.push(BackendCall::Cleanup);
        state.policies.clear();
        Ok(())
    }
}
