//! Foreman rules (§3 "ForemanRule", §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single clause in a `ClientRuleSet`. All clauses in a set are AND-ed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRuleClause {
    /// Regex over a named client attribute (e.g. hostname).
    Regex { attribute: String, pattern: String },
    /// Integer comparison over a named client counter (e.g. last-boot time).
    IntegerCompare {
        attribute: String,
        op: CompareOp,
        value: i64,
    },
    /// The client must carry every named label.
    LabelSet { labels: Vec<String> },
    /// The client's OS must be one of these.
    Os { allowed: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRuleSet {
    pub clauses: Vec<ClientRuleClause>,
}

/// One action triggered by a matching rule: schedule a client onto a hunt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanAction {
    pub hunt_id: String,
    pub client_limit: Option<u64>,
}

/// A foreman rule (§3). The foreman subject carries a list of these under
/// predicate `RULES`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanRule {
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub description: String,
    pub client_rule_set: ClientRuleSet,
    pub actions: Vec<ForemanAction>,
}

impl ForemanRule {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }
}
