//! Client frontend (§4.8): the HTTP side of the wire. One endpoint accepts a
//! client's check-in bundle, routes inbound messages onto their sessions,
//! runs the foreman, and hands back whatever outbound work is waiting.
//!
//! Grounded on `dwctl::api::handlers`'s "thin handler, fat service struct"
//! shape and `batcher/src/main.rs`'s `AppState`/`Router::with_state` wiring,
//! generalized from one-shot HTTP batch submission to a polling check-in
//! loop. `dwctl::auth::middleware`'s request-interception shape informs
//! verifying the bundle signature before anything else runs.

mod error;
mod verifier;

pub use error::{FrontendError, Result};
pub use verifier::{AcceptAllVerifier, RejectAllVerifier, Verifier};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration as ChronoDuration;
use ranger_datastore::Datastore;
use ranger_flows::{FlowStateRecord, MessageRouter};
use ranger_foreman::Foreman;
use ranger_proto::{AuthState, FleetMessage, Subject};
use ranger_queue::{AcceptAll, QueueManager};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Tuning knobs for one frontend process (§6 "frontend --bind").
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Flow classes allowed to accept unauthenticated messages (§4.8 step 1:
    /// "unauthenticated messages are accepted only for enrollment flows").
    pub enrollment_flow_classes: HashSet<String>,
    /// How many outbound messages a single check-in may claim (§4.8 step 4).
    pub max_outbound_per_checkin: usize,
    /// How long a claimed outbound message is leased for before it's
    /// eligible for re-delivery to a client that never received it.
    pub outbound_lease: ChronoDuration,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            enrollment_flow_classes: HashSet::new(),
            max_outbound_per_checkin: 100,
            outbound_lease: ChronoDuration::seconds(600),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    datastore: Arc<dyn Datastore>,
    queue: Arc<QueueManager>,
    router: Arc<MessageRouter>,
    foreman: Arc<Foreman>,
    verifier: Arc<dyn Verifier>,
    config: Arc<FrontendConfig>,
}

impl AppState {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queue: Arc<QueueManager>,
        router: Arc<MessageRouter>,
        foreman: Arc<Foreman>,
        verifier: Arc<dyn Verifier>,
        config: FrontendConfig,
    ) -> Self {
        Self {
            datastore,
            queue,
            router,
            foreman,
            verifier,
            config: Arc::new(config),
        }
    }

    /// Whether `session_id`'s flow class is allowlisted to accept
    /// unauthenticated traffic. Unknown sessions (not yet created, e.g. the
    /// very first enrollment message) are never allowlisted — enrollment
    /// flows are created before the client's first check-in round-trips.
    async fn is_enrollment_session(&self, session_id: &str) -> Result<bool> {
        let subject = Subject::flow(session_id);
        let Some(attr) = self.datastore.resolve(&subject, "task:state").await? else {
            return Ok(false);
        };
        let state: FlowStateRecord = serde_json::from_slice(&attr.value)?;
        Ok(self.config.enrollment_flow_classes.contains(&state.flow_class_name))
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckinRequest {
    pub client_id: String,
    /// Raw bundle bytes the signature was computed over.
    pub signed_bytes: Vec<u8>,
    pub signature: Vec<u8>,
    pub messages: Vec<FleetMessage>,
}

#[derive(Debug, Serialize)]
pub struct CheckinResponse {
    pub sent_count: usize,
    pub received_count: usize,
    pub messages: Vec<FleetMessage>,
}

/// §4.8: one check-in round. Verify, route inbound, run the foreman, claim
/// outbound.
#[tracing::instrument(skip(state, request), fields(client_id = %request.client_id))]
async fn checkin(State(state): State<AppState>, Json(request): Json<CheckinRequest>) -> std::result::Result<Json<CheckinResponse>, FrontendError> {
    let authenticated = state.verifier.verify(&request.client_id, &request.signed_bytes, &request.signature);

    let mut received_count = 0usize;
    for mut message in request.messages {
        message.auth_state = if authenticated {
            AuthState::Authenticated
        } else if state.is_enrollment_session(&message.session_id).await? {
            AuthState::Unauthenticated
        } else {
            tracing::warn!(session_id = %message.session_id, "dropping unauthenticated message outside an enrollment flow");
            AuthState::Desynchronized
        };

        if matches!(message.auth_state, AuthState::Desynchronized) {
            continue;
        }

        match state.router.route_inbound(message).await {
            Ok(_) => received_count += 1,
            Err(ranger_flows::RouterError::UnknownRequest(session_id, request_id)) => {
                tracing::warn!(session_id = %session_id, request_id, "response for unknown request, dropping");
            }
            Err(err) => return Err(err.into()),
        }
    }

    state.foreman.assign_tasks_to_client(&request.client_id).await?;

    let outbound_queue = format!("C.{}", request.client_id);
    let claims = state
        .queue
        .claim_notifications(&outbound_queue, state.config.outbound_lease, &AcceptAll, state.config.max_outbound_per_checkin)
        .await?;

    let outbound_subject = Subject::queue(&outbound_queue);
    let mut messages = Vec::with_capacity(claims.len());
    let mut delivered_record_ids = Vec::with_capacity(claims.len());
    for claim in &claims {
        let predicate_regex = format!("^msg:{}:", regex::escape(&claim.session_id));
        let attrs = state
            .datastore
            .resolve_regex(&outbound_subject, &predicate_regex, ranger_proto::ReadMode::Newest, None)
            .await?;
        for attr in attrs {
            let message: FleetMessage = serde_json::from_slice(&attr.value)?;
            messages.push(message);
        }
        delivered_record_ids.push(claim.record_id.clone());
    }

    // The lease, not deletion, is what protects a disconnected client — the
    // message stays queued until the client's next check-in re-delivers it,
    // or the flow runner retransmits and eventually gives up (§4.3, §4.8
    // step 4 "stamp them with a lease (so a disconnected client
    // re-receives them)").
    let _ = &delivered_record_ids;

    Ok(Json(CheckinResponse {
        sent_count: messages.len(),
        received_count,
        messages,
    }))
}

async fn healthz() -> &'static str {
    "OK"
}

/// Assemble the check-in router plus ambient `/healthz` and `/metrics`
/// (§4.8 "(ambient) Observability endpoint"), grounded on `dwctl`'s
/// `TraceLayer` + `axum-prometheus` combination.
pub fn router(state: AppState) -> Router {
    let (prometheus_layer, metric_handle) = axum_prometheus::PrometheusMetricLayer::pair();

    Router::new()
        .route("/checkin", post(checkin))
        .with_state(state)
        .route("/healthz", get(healthz))
        .route("/metrics", get(move || async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use ranger_datastore::in_memory::InMemoryDatastore;
    use ranger_flows::{Action, FlowCategory, FlowContext, FlowDescriptor, FlowRegistry, FlowRunner};
    use ranger_proto::{MessageType, Priority, RequestState, StatusOutcome, TypedPayload};
    use tower::ServiceExt;

    fn noop_start(_ctx: &mut FlowContext) -> std::result::Result<Vec<Action>, String> {
        Ok(vec![Action::CallClient {
            action_name: "Stat".to_string(),
            payload: TypedPayload::new("Stat", &serde_json::json!({"path": "/tmp"})).unwrap(),
            next_state: "Done".to_string(),
            request_data: None,
        }])
    }

    fn done(_ctx: &mut FlowContext) -> std::result::Result<Vec<Action>, String> {
        Ok(vec![Action::Terminate])
    }

    async fn harness() -> (AppState, Arc<InMemoryDatastore>, Arc<QueueManager>) {
        let ds = Arc::new(InMemoryDatastore::new());
        let qm = Arc::new(QueueManager::new(ds.clone()));

        let mut registry = FlowRegistry::new();
        registry
            .register(FlowDescriptor::new("Stat", FlowCategory::Collection).with_state("Start", noop_start as _).with_state("Done", done as _))
            .unwrap();
        let registry = Arc::new(registry);

        let runner = Arc::new(FlowRunner::new(ds.clone(), qm.clone(), registry, "W"));
        let msg_router = Arc::new(MessageRouter::new(ds.clone(), qm.clone(), "W"));
        let foreman = Arc::new(Foreman::new(ds.clone(), qm.clone()));

        // Seed a session with one outstanding request already assigned to
        // C.1, exactly as FlowRunner::run_session would have left it after
        // dispatching a CallClient.
        let session_id = "W:aaaa";
        let state = FlowStateRecord::new(
            session_id.to_string(),
            "Stat".to_string(),
            "tester".to_string(),
            serde_json::json!({}),
            Some("C.1".to_string()),
            None,
            None,
            None,
        );
        let subject = Subject::flow(session_id);
        ds.set(&subject, "task:state", serde_json::to_vec(&state).unwrap(), None, true).await.unwrap();
        let request = RequestState::new(1, "Start".to_string(), Some("C.1".to_string()));
        ds.set(&subject, "task:request_1", serde_json::to_vec(&request).unwrap(), None, true).await.unwrap();

        let outbound = FleetMessage {
            session_id: session_id.to_string(),
            request_id: 1,
            response_id: 0,
            name: "Stat".to_string(),
            auth_state: AuthState::Authenticated,
            priority: Priority::Medium,
            message_type: MessageType::Message,
            payload: TypedPayload::new("Stat", &serde_json::json!({"path": "/tmp"})).unwrap(),
            cpu_limit: None,
            network_bytes_limit: None,
        };
        let client_queue_subject = Subject::queue("C.1");
        ds.set(&client_queue_subject, "msg:W:aaaa:1", serde_json::to_vec(&outbound).unwrap(), None, true).await.unwrap();
        qm.queue_notification("C.1", session_id, chrono::Utc::now(), 0).await.unwrap();

        let config = FrontendConfig::default();
        let state = AppState::new(ds.clone(), qm.clone(), msg_router, foreman, Arc::new(AcceptAllVerifier), config);
        let _ = runner;
        (state, ds, qm)
    }

    fn body_json(value: serde_json::Value) -> axum::body::Body {
        axum::body::Body::from(serde_json::to_vec(&value).unwrap())
    }

    #[tokio::test]
    async fn checkin_claims_outbound_and_routes_inbound_status() {
        let (state, _ds, _qm) = harness().await;
        let app = router(state);

        let status = StatusOutcome { response_id: 0, ok: true, backtrace: None, cpu_time_used: 0.1, network_bytes_sent: 32 };
        let inbound = FleetMessage {
            session_id: "W:aaaa".to_string(),
            request_id: 1,
            response_id: 0,
            name: "".to_string(),
            auth_state: AuthState::Unauthenticated,
            priority: Priority::Medium,
            message_type: MessageType::Status,
            payload: TypedPayload::new("StatusOutcome", &status).unwrap(),
            cpu_limit: None,
            network_bytes_limit: None,
        };
        let body = body_json(serde_json::json!({
            "client_id": "C.1",
            "signed_bytes": [],
            "signature": [],
            "messages": [inbound],
        }));

        let request = axum::http::Request::builder().method("POST").uri("/checkin").header("content-type", "application/json").body(body).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: CheckinResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.received_count, 1);
        assert_eq!(parsed.sent_count, 1, "the pre-queued outbound Stat request must be claimed and returned");
        assert_eq!(parsed.messages[0].session_id, "W:aaaa");
    }

    #[tokio::test]
    async fn unauthenticated_message_outside_enrollment_is_dropped() {
        let (state, ds, _qm) = harness().await;
        let state = AppState::new(
            state.datastore.clone(),
            state.queue.clone(),
            state.router.clone(),
            state.foreman.clone(),
            Arc::new(RejectAllVerifier),
            FrontendConfig::default(),
        );
        let app = router(state);

        let status = StatusOutcome { response_id: 0, ok: true, backtrace: None, cpu_time_used: 0.0, network_bytes_sent: 0 };
        let inbound = FleetMessage {
            session_id: "W:aaaa".to_string(),
            request_id: 1,
            response_id: 0,
            name: "".to_string(),
            auth_state: AuthState::Unauthenticated,
            priority: Priority::Medium,
            message_type: MessageType::Status,
            payload: TypedPayload::new("StatusOutcome", &status).unwrap(),
            cpu_limit: None,
            network_bytes_limit: None,
        };
        let body = body_json(serde_json::json!({
            "client_id": "C.1",
            "signed_bytes": [],
            "signature": [],
            "messages": [inbound],
        }));
        let request = axum::http::Request::builder().method("POST").uri("/checkin").header("content-type", "application/json").body(body).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: CheckinResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.received_count, 0, "an unauthenticated message outside an enrollment flow class must not be routed");

        let subject = Subject::flow("W:aaaa");
        let request_state = ds.resolve(&subject, "task:request_1").await.unwrap().unwrap();
        let request_state: RequestState = serde_json::from_slice(&request_state.value).unwrap();
        assert!(request_state.status.is_none(), "the STATUS must never have been applied");
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (state, _ds, _qm) = harness().await;
        let app = router(state);
        let request = axum::http::Request::builder().method("GET").uri("/healthz").body(axum::body::Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"OK");
    }
}
