//! Multi-party approvals (§3 "Approval").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted authorization artifact gating access to a client, hunt, or
/// cron job, subject `ACL/<target>/<requester>/<reason-hash>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub target: String,
    pub requester: String,
    pub reason: String,
    pub notified_users: Vec<String>,
    pub email_cc_addresses: Vec<String>,
    /// Append-only; the requester is never counted as an approver (invariant).
    pub approvers: Vec<String>,
    pub expires: DateTime<Utc>,
    pub is_emergency: bool,
}

impl Approval {
    pub fn new(target: impl Into<String>, requester: impl Into<String>, reason: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Self {
            target: target.into(),
            requester: requester.into(),
            reason: reason.into(),
            notified_users: Vec::new(),
            email_cc_addresses: Vec::new(),
            approvers: Vec::new(),
            expires,
            is_emergency: false,
        }
    }

    /// Record a new approver. The requester may never approve their own
    /// request (§3 invariant); duplicate approvers are not double-counted.
    pub fn add_approver(&mut self, approver: &str) {
        if approver == self.requester {
            return;
        }
        if !self.approvers.iter().any(|a| a == approver) {
            self.approvers.push(approver.to_string());
        }
    }

    pub fn is_unexpired(&self, now: DateTime<Utc>) -> bool {
        now < self.expires
    }

    pub fn approver_count(&self) -> usize {
        self.approvers.len()
    }
}
