//! Read-only HTTP health endpoint
//!
//! `GET /status` probes the backend live and returns the observed link state
//! next to the engine's own state. Every other path answers 404.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use warden_core::endpoints;

use crate::engine::{HealthSnapshot, ReconciliationEngine};

#[derive(Debug, Clone)]
pub struct HealthReporter {
    engine: ReconciliationEngine,
}

impl HealthReporter {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self { engine }
    }

    pub async fn get_status(&self) -> HealthSnapshot {
        self.engine.snapshot().await
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(endpoints::STATUS, get(status))
            .fallback(not_found)
            .with_state(Arc::new(self))
    }

    /// Serve on `0.0.0.0:port` until `shutdown` turns true.
    pub async fn serve(self, port: u16, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Health API listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        info!("Health API stopped");
        Ok(())
    }
}

async fn status(State(reporter): State<Arc<HealthReporter>>) -> Json<HealthSnapshot> {
    let snapshot = reporter.get_status().await;
    debug!(
        "Health query: status={} agent_state={}",
        snapshot.status, snapshot.agent_state
    );
    Json(snapshot)
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use warden_backend::{BackendCall, InMemoryBackend};
    use warden_core::{load_str, AgentState, ConfigFormat, ObservedState};

    fn engine(backend: Arc<InMemoryBackend>) -> ReconciliationEngine {
        let config = load_str(
            r#"{"connections": [{"name": "hq", "auth": {"type": "psk", "value": "k"},
                "encryption": {"ike": "aes256-sha256-dh14", "esp": "aes256"},
                "local_subnets": ["10.0.0.0/24"], "remote_subnets": ["10.9.0.0/24"]}],
                "api_port": 8080}"#,
            Some(ConfigFormat::Json),
        )
        .unwrap();
        ReconciliationEngine::new(Arc::new(config), backend)
    }

    async fn get(router: Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_connected_after_apply() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend);
        engine.apply().await;

        let (code, body) = get(HealthReporter::new(engine).router(), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "status": "CONNECTED", "agent_state": "CONNECTED" })
        );
    }

    #[tokio::test]
    async fn status_probes_live_and_leaves_state_alone() {
        let backend = Arc::new(InMemoryBackend::new().with_observations([
            Ok(ObservedState::Connected),
            Ok(ObservedState::Disconnected),
        ]));
        let engine = engine(backend.clone());
        engine.apply().await;

        let (_, body) = get(HealthReporter::new(engine.clone()).router(), "/status").await;
        assert_eq!(body["status"], "DISCONNECTED");
        assert_eq!(body["agent_state"], "CONNECTED");
        assert_eq!(engine.state(), AgentState::Connected);
        assert_eq!(backend.count(BackendCall::Status), 2);
        assert_eq!(backend.count(BackendCall::Apply), 1);
    }

    #[tokio::test]
    async fn before_first_apply_state_is_init() {
        let engine = engine(Arc::new(InMemoryBackend::new()));
        let (_, body) = get(HealthReporter::new(engine).router(), "/status").await;
        assert_eq!(body, json!({ "status": "DISCONNECTED", "agent_state": "INIT" }));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let engine = engine(Arc::new(InMemoryBackend::new()));
        for path in ["/", "/health", "/status/extra"] {
            let (code, body) = get(HealthReporter::new(engine.clone()).router(), path).await;
            assert_eq!(code, StatusCode::NOT_FOUND, "{path}");
            assert_eq!(body, json!({ "error": "not found" }));
        }
    }
}
