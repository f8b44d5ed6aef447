//! The in-memory capability carried through every server operation (§3 "Token").

use chrono::{DateTime, Utc};

/// Never persisted: constructed fresh per call chain and dropped at the end
/// of the operation it authorizes.
#[derive(Debug, Clone)]
pub struct Token {
    pub username: String,
    pub reason: String,
    pub source_ips: Vec<String>,
    pub expiry: DateTime<Utc>,
    /// Bypass flag, settable only by the worker for system-originated work.
    pub supervisor: bool,
}

impl Token {
    pub fn new(username: impl Into<String>, reason: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            reason: reason.into(),
            source_ips: Vec::new(),
            expiry,
            supervisor: false,
        }
    }

    /// The worker's own system identity, used for flow/hunt-internal
    /// operations that are never subject to approval checks (§4.9).
    pub fn supervisor_token(expiry: DateTime<Utc>) -> Self {
        Self {
            username: "RangerWorker".to_string(),
            reason: "system".to_string(),
            source_ips: Vec::new(),
            expiry,
            supervisor: true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}
