//! Shared data model for the ranger fleet forensics engine.
//!
//! This crate holds the types every other `ranger-*` crate persists, wires,
//! or passes across a session lock: the datastore subject/predicate/value
//! primitive (§3 "Subject" / "Attribute value"), the `FleetMessage` wire unit,
//! per-session `RequestState`, per-flow and per-hunt persisted state, foreman
//! rules, approvals, and the in-memory capability token. None of these types
//! know how to store or transport themselves — that's `ranger-datastore` and
//! `ranger-frontend`.

pub mod approval;
pub mod foreman;
pub mod hunt;
pub mod message;
pub mod payload;
pub mod session_id;
pub mod subject;
pub mod token;

pub use approval::Approval;
pub use foreman::{ClientRuleClause, ClientRuleSet, CompareOp, ForemanAction, ForemanRule};
pub use hunt::{
    hunt_addclient_queue, hunt_register_queue, hunt_results_queue, hunt_status_queue, HuntContext, HuntState,
    OutputPluginDescriptor, UsageStats,
};
pub use message::{AuthState, FleetMessage, MessageType, Priority};
pub use payload::TypedPayload;
pub use session_id::{is_hunt_session, SessionId};
pub use subject::{AttrValue, ReadMode, Subject};
pub use token::Token;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a flow or hunt (§3 "Flow state" / "Lifecycles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowLifecycle {
    Running,
    Pending,
    Terminated,
    Error,
}

impl FlowLifecycle {
    /// Terminal states are sticky: once set, a later worker tick must never
    /// overwrite them (§3 "Lifecycles").
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowLifecycle::Terminated | FlowLifecycle::Error)
    }
}

/// Accumulated client resource usage for a flow or hunt (§3 "client_resources").
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientResources {
    pub cpu_usage: f64,
    pub network_bytes_sent: u64,
}

impl ClientResources {
    pub fn add(&mut self, other: ClientResources) {
        self.cpu_usage += other.cpu_usage;
        self.network_bytes_sent += other.network_bytes_sent;
    }
}

/// A single request's persisted bookkeeping row within a session (§3 "RequestState").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    pub request_id: u64,
    pub next_state: String,
    pub client_id: Option<String>,
    pub status: Option<StatusOutcome>,
    pub response_count: u64,
    pub data: Option<serde_json::Value>,
    pub transmission_count: u32,
}

impl RequestState {
    pub const MAX_TRANSMISSIONS: u32 = 5;

    pub fn new(request_id: u64, next_state: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            request_id,
            next_state: next_state.into(),
            client_id,
            status: None,
            response_count: 0,
            data: None,
            transmission_count: 0,
        }
    }

    /// True once the STATUS for this request has arrived and every response
    /// it promised has also arrived (§4.3 "A request is complete when...").
    pub fn is_complete(&self) -> bool {
        match &self.status {
            Some(status) => self.response_count == status.response_id.saturating_sub(1),
            None => false,
        }
    }

    pub fn can_retransmit(&self) -> bool {
        self.transmission_count < Self::MAX_TRANSMISSIONS
    }
}

/// The outcome carried by a request's terminal STATUS message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutcome {
    pub response_id: u64,
    pub ok: bool,
    pub backtrace: Option<String>,
    pub cpu_time_used: f64,
    pub network_bytes_sent: u64,
}
