//! Reconciliation Engine
//!
//! Drives a platform backend through apply → verify → monitor → repair.
//! The engine is the only writer of [`AgentState`]. Every backend call goes
//! through one async mutex and a timeout, so a health probe and a scheduled
//! re-apply never interleave mid-operation and no call can hang the loop.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use warden_core::{
    AgentConfiguration, AgentState, ApplyReport, BackendError, BackendResult, IpsecBackend,
    ObservedState,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Idle time between two status probes.
    pub poll_interval: Duration,
    /// Ceiling for a single backend command.
    pub call_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AgentConfiguration) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            call_timeout: config.command_timeout(),
        }
    }

    /// An apply pass runs one cleanup plus one command per connection.
    pub fn apply_timeout(&self, connections: usize) -> Duration {
        let commands = u32::try_from(connections.saturating_add(1)).unwrap_or(u32::MAX);
        self.call_timeout.saturating_mul(commands)
    }
}

/// Signals emitted by the engine. Also logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged { from: AgentState, to: AgentState },
    Recovered,
    ConnectionLost,
    ApplyFailed { reason: String },
    Stopped,
}

/// Result of the last apply attempt for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionOutcome {
    pub applied: bool,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// What the health endpoint reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: ObservedState,
    pub agent_state: AgentState,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    config: Arc<AgentConfiguration>,
    backend: Arc<dyn IpsecBackend>,
    settings: EngineSettings,
    state: Arc<RwLock<AgentState>>,
    /// Serializes every backend call.
    backend_guard: Arc<Mutex<()>>,
    outcomes: Arc<RwLock<BTreeMap<String, ConnectionOutcome>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("backend", &self.backend.name())
            .field("connections", &self.config.connections().len())
            .field("state", &*self.state.read())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ReconciliationEngine {
    pub fn new(config: Arc<AgentConfiguration>, backend: Arc<dyn IpsecBackend>) -> Self {
        let settings = EngineSettings::from_config(&config);
        Self::with_settings(config, backend, settings)
    }

    pub fn with_settings(
        config: Arc<AgentConfiguration>,
        backend: Arc<dyn IpsecBackend>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            backend,
            settings,
            state: Arc::new(RwLock::new(AgentState::Init)),
            backend_guard: Arc::new(Mutex::new(())),
            outcomes: Arc::new(RwLock::new(BTreeMap::new())),
            events,
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn config(&self) -> &AgentConfiguration {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn connection_outcomes(&self) -> BTreeMap<String, ConnectionOutcome> {
        self.outcomes.read().clone()
    }

    /// Apply policy, then verify the link once.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn apply(&self) -> AgentState {
        self.transition(AgentState::Applying);
        info!("Applying IPsec policy...");

        let timeout = self.settings.apply_timeout(self.config.connections().len());
        let result = self
            .call("apply", timeout, self.backend.apply_policy(&self.config))
            .await;

        match result {
            Err(e) => {
                error!("Failed to apply policy: {}", e);
                self.record_total_failure(&e);
                self.emit(EngineEvent::ApplyFailed {
                    reason: e.to_string(),
                });
                self.transition(AgentState::Error);
            }
            Ok(report) => {
                self.record_report(&report);
                info!(
                    "Policy application reported success ({} of {} connections)",
                    report.applied_count(),
                    self.config.connections().len()
                );

                match self.probe().await {
                    ObservedState::Connected => {
                        info!("Link is UP (verified)");
                        self.transition(AgentState::Connected);
                    }
                    ObservedState::Disconnected => {
                        warn!("Policy applied but link is not yet CONNECTED; waiting for negotiation");
                        self.transition(AgentState::Disconnected);
                    }
                }
            }
        }

        self.state()
    }

    /// One monitor cycle: probe, and repair when the link is down.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn poll_once(&self) -> AgentState {
        let current = self.state();

        match self.probe().await {
            ObservedState::Connected => {
                if current != AgentState::Connected {
                    self.transition(AgentState::Connected);
                    info!("Link recovered");
                    self.emit(EngineEvent::Recovered);
                } else {
                    debug!("Heartbeat: connected");
                }
            }
            ObservedState::Disconnected => {
                if current == AgentState::Connected {
                    warn!("Lost connection!");
                    self.emit(EngineEvent::ConnectionLost);
                }
                info!("Link is DOWN. Re-applying policy...");
                self.transition(AgentState::Disconnected);
                self.repair().await;
            }
        }

        self.state()
    }

    /// Tear everything down and apply again.
    async fn repair(&self) {
        if let Err(e) = self.cleanup().await {
            warn!("Cleanup before re-apply failed: {}", e);
        }
        self.apply().await;
    }

    /// Live status probe. Failures and timeouts count as `Disconnected`.
    pub async fn probe(&self) -> ObservedState {
        match self.check().await {
            Ok(observed) => observed,
            Err(e) => {
                warn!("Status check failed, treating link as down: {}", e);
                ObservedState::Disconnected
            }
        }
    }

    /// Raw status call, bounded by the command timeout.
    pub async fn check(&self) -> BackendResult<ObservedState> {
        self.call("status", self.settings.call_timeout, self.backend.check_status())
            .await
    }

    pub async fn cleanup(&self) -> BackendResult<()> {
        self.call("cleanup", self.settings.call_timeout, self.backend.cleanup())
            .await
    }

    /// Current link status (probed live) and agent state. Never changes state.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let status = self.probe().await;
        HealthSnapshot {
            status,
            agent_state: self.state(),
        }
    }

    /// Run until `shutdown` turns true (or its sender is dropped), then clean up.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Agent starting: {} connection(s), backend '{}', poll every {:?}",
            self.config.connections().len(),
            self.backend.name(),
            self.settings.poll_interval
        );

        self.guarded(|engine| async move {
            engine.apply().await;
        })
        .await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.guarded(|engine| async move {
                engine.poll_once().await;
            })
            .await;
        }

        self.stop().await;
    }

    /// Final cleanup. Always runs on the way out.
    pub async fn stop(&self) {
        info!("Agent stopping, cleaning up policies...");
        if let Err(e) = self.cleanup().await {
            error!("Cleanup on shutdown failed: {}", e);
        }
        self.emit(EngineEvent::Stopped);
    }

    /// Runs one step on its own task so a panicking backend surfaces as
    /// `Error` instead of taking the loop down.
    async fn guarded<F, Fut>(&self, step: F)
    where
        F: FnOnce(ReconciliationEngine) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = tokio::spawn(step(self.clone())).await {
            error!("Unexpected error in monitor loop: {}", e);
            self.transition(AgentState::Error);
        }
    }

    async fn call<T, F>(&self, operation: &'static str, limit: Duration, fut: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        let _guard = self.backend_guard.lock().await;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                error!("Backend {} timed out after {:?}", operation, limit);
                Err(BackendError::Timeout {
                    operation,
                    after: limit,
                })
            }
        }
    }

    fn transition(&self, to: AgentState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            info!("State transition: {} -> {}", from, to);
            self.emit(EngineEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record_report(&self, report: &ApplyReport) {
        let now = Utc::now();
        let mut outcomes = self.outcomes.write();
        for name in &report.applied {
            outcomes.insert(
                name.clone(),
                ConnectionOutcome {
                    applied: true,
                    detail: None,
                    at: now,
                },
            );
        }
        for failure in &report.failed {
            warn!(
                connection = %failure.connection,
                "Policy not applied: {}", failure.error
            );
            outcomes.insert(
                failure.connection.clone(),
                ConnectionOutcome {
                    applied: false,
                    detail: Some(failure.error.to_string()),
                    at: now,
                },
            );
        }
    }

    fn record_total_failure(&self, error: &BackendError) {
        let now = Utc::now();
        let mut outcomes = self.outcomes.write();
        for conn in self.config.connections() {
            outcomes.insert(
                conn.name.clone(),
                ConnectionOutcome {
                    applied: false,
                    detail: Some(error.to_string()),
                    at: now,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_backend::{BackendCall, InMemoryBackend};
    use warden_core::{load_str, ConfigFormat};

    fn config(connections: usize) -> Arc<AgentConfiguration> {
        let entries: Vec<String> = (0..connections)
            .map(|i| {
                format!(
                    r#"{{"name": "conn-{i}", "auth": {{"type": "psk", "value": "k"}},
                        "encryption": {{"ike": "aes256-sha256-dh14", "esp": "aes256gcm16"}},
                        "local_subnets": ["10.{i}.0.0/24"], "remote_subnets": ["172.16.{i}.0/24"]}}"#
                )
            })
            .collect();
        let text = format!(
            r#"{{"connections": [{}], "poll_interval_secs": 5, "command_timeout_secs": 1}}"#,
            entries.join(",")
        );
        Arc::new(load_str(&text, Some(ConfigFormat::Json)).unwrap())
    }

    fn engine_with(backend: Arc<InMemoryBackend>) -> ReconciliationEngine {
        ReconciliationEngine::new(config(2), backend)
    }

    fn connected() -> BackendResult<ObservedState> {
        Ok(ObservedState::Connected)
    }

    fn disconnected() -> BackendResult<ObservedState> {
        Ok(ObservedState::Disconnected)
    }

    #[tokio::test]
    async fn starts_in_init() {
        let engine = engine_with(Arc::new(InMemoryBackend::new()));
        assert_eq!(engine.state(), AgentState::Init);
    }

    #[tokio::test]
    async fn apply_then_connected() {
        let backend = Arc::new(InMemoryBackend::new().with_observations([connected()]));
        let engine = engine_with(backend.clone());
        let mut events = engine.subscribe();

        assert_eq!(engine.apply().await, AgentState::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::StateChanged {
                from: AgentState::Init,
                to: AgentState::Applying
            }
        );
        assert_eq!(backend.calls(), vec![BackendCall::Apply, BackendCall::Status]);
        assert!(engine.connection_outcomes().values().all(|o| o.applied));
    }

    #[tokio::test]
    async fn apply_then_not_yet_negotiated() {
        let backend = Arc::new(InMemoryBackend::new().with_observations([disconnected()]));
        let engine = engine_with(backend);
        assert_eq!(engine.apply().await, AgentState::Disconnected);
    }

    #[tokio::test]
    async fn total_apply_failure_is_error() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_connection("conn-0");
        backend.fail_connection("conn-1");
        let engine = engine_with(backend.clone());
        let mut events = engine.subscribe();

        assert_eq!(engine.apply().await, AgentState::Error);
        // No verification after a failed apply.
        assert_eq!(backend.count(BackendCall::Status), 0);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, EngineEvent::ApplyFailed { .. });
        }
        assert!(saw_failure);
        assert!(engine.connection_outcomes().values().all(|o| !o.applied));
    }

    #[tokio::test]
    async fn partial_apply_still_verifies() {
        let backend = Arc::new(InMemoryBackend::new().with_observations([connected()]));
        backend.fail_connection("conn-1");
        let engine = engine_with(backend);

        assert_eq!(engine.apply().await, AgentState::Connected);
        let outcomes = engine.connection_outcomes();
        assert!(outcomes["conn-0"].applied);
        assert!(!outcomes["conn-1"].applied);
        assert!(outcomes["conn-1"].detail.as_deref().unwrap().contains("simulated"));
    }

    #[tokio::test]
    async fn reaches_connected_within_two_cycles() {
        let backend = Arc::new(
            InMemoryBackend::new().with_observations([disconnected(), connected()]),
        );
        let engine = engine_with(backend);

        assert_eq!(engine.apply().await, AgentState::Disconnected);
        assert_eq!(engine.poll_once().await, AgentState::Connected);
        for _ in 0..5 {
            assert_eq!(engine.poll_once().await, AgentState::Connected);
        }
    }

    #[tokio::test]
    async fn every_drop_triggers_one_cleanup_then_one_apply() {
        let pattern = [connected(), disconnected()];
        let observations: Vec<_> = pattern.iter().cycle().take(40).cloned().collect();
        let backend = Arc::new(InMemoryBackend::new().with_observations(observations.clone()));
        let engine = engine_with(backend.clone());
        let mut events = engine.subscribe();

        engine.apply().await;
        for _ in 0..10 {
            engine.poll_once().await;
        }

        let calls = backend.calls();
        let mut served = observations.iter();
        let mut drops = 0;
        for (i, call) in calls.iter().enumerate() {
            if *call != BackendCall::Status {
                continue;
            }
            if served.next().unwrap() == &disconnected() {
                // The verify probe after a repair is itself a status call.
                if i + 1 < calls.len() {
                    drops += 1;
                    assert_eq!(calls[i + 1], BackendCall::Cleanup, "at {i}: {calls:?}");
                    assert_eq!(calls[i + 2], BackendCall::Apply, "at {i}: {calls:?}");
                    assert_eq!(calls[i + 3], BackendCall::Status, "at {i}: {calls:?}");
                }
            }
        }
        assert!(drops > 0);

        let mut lost = 0;
        while let Ok(event) = events.try_recv() {
            if event == EngineEvent::ConnectionLost {
                lost += 1;
            }
        }
        assert!(lost > 0);
    }

    #[tokio::test]
    async fn probe_failure_is_fail_closed() {
        let backend = Arc::new(InMemoryBackend::new().with_observations([
            connected(),
            Err(BackendError::malformed("garbage")),
            connected(),
        ]));
        let engine = engine_with(backend.clone());

        assert_eq!(engine.apply().await, AgentState::Connected);
        engine.poll_once().await;
        // The failed probe counted as a drop and caused a repair.
        assert_eq!(backend.count(BackendCall::Cleanup), 1);
        assert_eq!(backend.count(BackendCall::Apply), 2);
        assert_eq!(engine.state(), AgentState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_call_times_out() {
        let backend = Arc::new(InMemoryBackend::new().with_delay(Duration::from_secs(30)));
        let engine = engine_with(backend);
        let ceiling = engine.settings().call_timeout;

        let started = tokio::time::Instant::now();
        let err = engine.check().await.unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(started.elapsed() <= ceiling + Duration::from_millis(50));

        assert_eq!(engine.probe().await, ObservedState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_apply_times_out_at_the_pass_ceiling() {
        let backend = Arc::new(InMemoryBackend::new().with_delay(Duration::from_secs(30)));
        let engine = engine_with(backend.clone());
        let mut events = engine.subscribe();

        // One cleanup plus one command per connection.
        let ceiling = engine.settings().apply_timeout(2);
        assert_eq!(ceiling, Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        assert_eq!(engine.apply().await, AgentState::Error);
        assert!(started.elapsed() <= ceiling + Duration::from_millis(50));
        assert_eq!(backend.count(BackendCall::Apply), 0);

        let outcomes = engine.connection_outcomes();
        let expected = BackendError::Timeout {
            operation: "apply",
            after: ceiling,
        }
        .to_string();
        assert_eq!(outcomes["conn-0"].detail.as_deref(), Some(expected.as_str()));

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ApplyFailed { reason } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![expected]);
    }

    #[tokio::test]
    async fn snapshot_probes_without_changing_state() {
        let backend = Arc::new(InMemoryBackend::new().with_observations([
            connected(),
            disconnected(),
        ]));
        let engine = engine_with(backend.clone());
        engine.apply().await;

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.status, ObservedState::Disconnected);
        assert_eq!(snapshot.agent_state, AgentState::Connected);
        assert_eq!(engine.state(), AgentState::Connected);
        assert_eq!(backend.count(BackendCall::Status), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_promptly_and_cleans_up() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_with(backend.clone());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(rx).await }
        });

        // Three full cycles, then stop mid-wait.
        tokio::time::sleep(Duration::from_secs(17)).await;
        let started = tokio::time::Instant::now();
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(started.elapsed() < engine.settings().poll_interval);
        assert_eq!(backend.calls().last(), Some(&BackendCall::Cleanup));
        assert_eq!(backend.count(BackendCall::Apply), 1);
        assert_eq!(backend.count(BackendCall::Status), 4);
        assert!(backend.policies().is_empty());
    }

    #[derive(Debug, Default)]
    struct PanickingBackend {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl IpsecBackend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn apply_policy(&self, config: &AgentConfiguration) -> BackendResult<ApplyReport> {
            let mut report = ApplyReport::default();
            for conn in config.connections() {
                report.record_success(&conn.name);
            }
            Ok(report)
        }

        async fn check_status(&self) -> BackendResult<ObservedState> {
            if self.probes.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("status query exploded");
            }
            Ok(ObservedState::Connected)
        }

        async fn cleanup(&self) -> BackendResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_backend_failure_is_error_but_loop_continues() {
        let backend = Arc::new(PanickingBackend::default());
        let engine = ReconciliationEngine::new(config(1), backend.clone());
        let mut events = engine.subscribe();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // apply-verify, panicking poll, recovering poll.
        assert!(backend.probes.load(Ordering::SeqCst) >= 3);
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        let error_at = states.iter().position(|s| *s == AgentState::Error).unwrap();
        assert_eq!(states[error_at + 1], AgentState::Connected);
        assert_eq!(engine.state(), AgentState::Connected);
    }
}
