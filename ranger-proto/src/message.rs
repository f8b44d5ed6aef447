//! `FleetMessage`: the unit of client/server communication (§3 "GrrMessage").

use crate::payload::TypedPayload;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Desynchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Message,
    Status,
    Iterator,
}

/// The wire unit exchanged between client and server (§3).
///
/// `request_id` is monotone per session starting at 1; `response_id` is
/// monotone per request starting at 1, with `0` reserved for the STATUS
/// message that closes out a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetMessage {
    pub session_id: String,
    pub request_id: u64,
    pub response_id: u64,
    pub name: String,
    pub auth_state: AuthState,
    pub priority: Priority,
    pub message_type: MessageType,
    pub payload: TypedPayload,
    pub cpu_limit: Option<f64>,
    pub network_bytes_limit: Option<u64>,
}

impl FleetMessage {
    pub fn is_status(&self) -> bool {
        matches!(self.message_type, MessageType::Status)
    }
}
