//! Session id allocation and formatting (§6 "Session id format").
//!
//! `<queue>:<12-hex>` for flows, `H:<12-hex>` for hunts. These strings are
//! human-visible (they appear in URLs and logs) so the format is fixed.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    fn random_12_hex() -> String {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn new_flow(queue: &str) -> Self {
        Self(format!("{queue}:{}", Self::random_12_hex()))
    }

    pub fn new_hunt() -> Self {
        Self(format!("H:{}", Self::random_12_hex()))
    }

    pub fn is_hunt(&self) -> bool {
        self.0.starts_with("H:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn subject_suffix(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// `true` if the raw session id string names a hunt rather than a flow.
pub fn is_hunt_session(session_id: &str) -> bool {
    session_id.starts_with("H:")
}
