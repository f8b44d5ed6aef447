//! The datastore primitive: subjects, predicates, timestamped values (§3, §4.1).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A hierarchical datastore key, segments joined by `/` (§3 "Subject").
///
/// Subjects form a naming tree: `clients/<id>`, `flows/<id>`, `hunts/<id>`,
/// `ACL/<subject>/<user>/<reason-hash>`, `foreman`, `queues/<queue>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject(String);

impl Subject {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn client(client_id: &str) -> Self {
        Self(format!("clients/{client_id}"))
    }

    pub fn flow(session_id: &str) -> Self {
        Self(format!("flows/{session_id}"))
    }

    pub fn hunt(hunt_id: &str) -> Self {
        Self(format!("hunts/{hunt_id}"))
    }

    pub fn hunt_child(hunt_id: &str, child: &str) -> Self {
        Self(format!("hunts/{hunt_id}/{child}"))
    }

    pub fn acl(target: &str, user: &str, reason_hash: &str) -> Self {
        Self(format!("ACL/{target}/{user}/{reason_hash}"))
    }

    pub fn foreman() -> Self {
        Self("foreman".to_string())
    }

    pub fn queue(name: &str) -> Self {
        Self(format!("queues/{name}"))
    }

    pub fn client_queue(client_id: &str) -> Self {
        Self(format!("C.{client_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if `self` is `prefix` or nested under it, used by `Query` scans.
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0 == prefix || self.0.starts_with(&format!("{prefix}/"))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Subject {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single timestamped version of a predicate's value (§3 "Attribute value").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrValue {
    pub predicate: String,
    pub value: Vec<u8>,
    /// Microsecond timestamp, matching §3's "microsecond-timestamp".
    pub timestamp_us: i64,
}

impl AttrValue {
    pub fn new(predicate: impl Into<String>, value: Vec<u8>, timestamp_us: i64) -> Self {
        Self {
            predicate: predicate.into(),
            value,
            timestamp_us,
        }
    }
}

/// The three mandatory read modes over a predicate's version history (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Latest version only.
    Newest,
    /// Every version.
    All,
    /// Versions whose timestamp falls in `[from, to]`.
    Range { from: i64, to: i64 },
}

impl ReadMode {
    pub fn matches(self, timestamp_us: i64) -> bool {
        match self {
            ReadMode::Newest | ReadMode::All => true,
            ReadMode::Range { from, to } => timestamp_us >= from && timestamp_us <= to,
        }
    }
}
