//! Flow state machine types (§9 "State-machine control flow -> tagged sum").

use chrono::{DateTime, Utc};
use ranger_proto::{ClientResources, FlowLifecycle, TypedPayload};
use serde::{Deserialize, Serialize};

/// Per-flow persisted record, predicate `task:state` on `flows/<session_id>`
/// (§3 "Flow state", §6 datastore layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStateRecord {
    pub session_id: String,
    pub flow_class_name: String,
    pub creator: String,
    pub args: serde_json::Value,
    pub current_state: String,
    pub next_outbound_id: u64,
    pub next_processed_request: u64,
    pub next_result_index: u64,
    pub create_time: DateTime<Utc>,
    pub lifecycle: FlowLifecycle,
    pub backtrace: Option<String>,
    pub client_resources: ClientResources,
    pub cpu_limit: Option<f64>,
    pub network_bytes_limit: Option<u64>,
    pub client_id: Option<String>,
    pub parent_session_id: Option<String>,
    /// The request slot on `parent_session_id` this flow's termination STATUS
    /// reports back to, set when the parent's `CallFlow` spawned it. `None`
    /// for hunt children, which report through `pending_result:` instead.
    pub parent_request_id: Option<u64>,
    /// User-defined typed sub-state, schema-tagged per §9.
    pub user_state: serde_json::Value,
    pub pending_termination: Option<String>,
}

/// Responses delivered to a state method for one completed request (§4.4
/// "Responses object").
#[derive(Debug, Clone)]
pub struct Responses {
    pub request_id: u64,
    pub payloads: Vec<TypedPayload>,
    pub success: bool,
    pub backtrace: Option<String>,
    pub request_data: Option<serde_json::Value>,
}

/// The tagged sum a state method returns (§9 redesign note). A single state
/// invocation may emit several actions (e.g. a few `SendReply`s followed by
/// one `CallClient`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    CallClient {
        action_name: String,
        payload: TypedPayload,
        next_state: String,
        request_data: Option<serde_json::Value>,
    },
    CallFlow {
        flow_class: String,
        args: TypedPayload,
        next_state: String,
    },
    CallState {
        payloads: Vec<TypedPayload>,
        next_state: String,
        start_time: Option<DateTime<Utc>>,
    },
    SendReply(TypedPayload),
    Log(String),
    Terminate,
    Error(String),
}

/// The input handed to a state method: immutable flow args, mutable
/// user-defined state, and the responses that completed this request.
pub struct FlowContext<'a> {
    pub args: &'a serde_json::Value,
    pub user_state: &'a mut serde_json::Value,
    pub responses: Responses,
}

impl FlowStateRecord {
    pub fn new(
        session_id: impl Into<String>,
        flow_class_name: impl Into<String>,
        creator: impl Into<String>,
        args: serde_json::Value,
        client_id: Option<String>,
        parent_session_id: Option<String>,
        cpu_limit: Option<f64>,
        network_bytes_limit: Option<u64>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            flow_class_name: flow_class_name.into(),
            creator: creator.into(),
            args,
            current_state: "Start".to_string(),
            next_outbound_id: 1,
            next_processed_request: 1,
            next_result_index: 0,
            create_time: Utc::now(),
            lifecycle: FlowLifecycle::Running,
            backtrace: None,
            client_resources: ClientResources::default(),
            cpu_limit,
            network_bytes_limit,
            client_id,
            parent_session_id,
            parent_request_id: None,
            user_state: serde_json::Value::Null,
            pending_termination: None,
        }
    }
}

/// A state method: looked up by name at each transition, the name persisted
/// in `RequestState::next_state` (§9 "Dynamic flow/plugin registration").
pub type StateFn = fn(&mut FlowContext) -> std::result::Result<Vec<Action>, String>;
