//! Foreman (§4.6): the rule-based dispatcher that matches client attributes
//! against installed rules on every check-in and schedules the client onto
//! any hunt whose rule matched.
//!
//! The foreman never starts a child flow itself — that would couple it to
//! the hunt engine's rate/limit bookkeeping. Instead a match writes a
//! dedupe marker onto the hunt subject and drops an `AddClient` notification
//! on that hunt's queue; `ranger-hunts` owns everything from there (§4.7).

mod attributes;
mod matcher;

pub use attributes::ClientAttributes;
pub use matcher::RegexCache;

use chrono::Utc;
use ranger_datastore::Datastore;
use ranger_proto::{hunt_addclient_queue, ForemanRule, Subject};
use ranger_queue::QueueManager;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForemanError>;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("queue error: {0}")]
    Queue(#[from] ranger_queue::QueueError),
    #[error("rule encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

const RULES_PREDICATE: &str = "RULES";

pub struct Foreman {
    datastore: Arc<dyn Datastore>,
    queue: Arc<QueueManager>,
    regex_cache: RegexCache,
}

impl Foreman {
    pub fn new(datastore: Arc<dyn Datastore>, queue: Arc<QueueManager>) -> Self {
        Self {
            datastore,
            queue,
            regex_cache: RegexCache::new(),
        }
    }

    async fn load_rules(&self) -> Result<Vec<ForemanRule>> {
        match self.datastore.resolve(&Subject::foreman(), RULES_PREDICATE).await? {
            Some(attr) => Ok(serde_json::from_slice(&attr.value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Install or replace a hunt's rule. Per §5's concurrency note, the
    /// whole `RULES` list is rewritten with `replace = true` rather than
    /// read-modify-written outside a transaction — the only read-then-write
    /// race is resolved by `assign_tasks_to_client`'s own transaction.
    #[tracing::instrument(skip(self, rule))]
    pub async fn install_rule(&self, rule: ForemanRule) -> Result<()> {
        let subject = Subject::foreman();
        let mut txn = self.datastore.begin_transaction(&subject).await?;
        let mut rules = self.load_rules().await?;
        rules.push(rule);
        txn.stage_set(RULES_PREDICATE, serde_json::to_vec(&rules)?, None, true);
        self.datastore.commit(txn).await?;
        Ok(())
    }

    /// Remove every rule whose actions target `hunt_id` (hunt pause/stop,
    /// §4.7 "Stop: removes foreman rule").
    #[tracing::instrument(skip(self))]
    pub async fn remove_rules_for_hunt(&self, hunt_id: &str) -> Result<()> {
        let subject = Subject::foreman();
        let mut txn = self.datastore.begin_transaction(&subject).await?;
        let rules = self.load_rules().await?;
        let retained: Vec<ForemanRule> = rules
            .into_iter()
            .filter(|rule| !rule.actions.iter().any(|action| action.hunt_id == hunt_id))
            .collect();
        txn.stage_set(RULES_PREDICATE, serde_json::to_vec(&retained)?, None, true);
        self.datastore.commit(txn).await?;
        Ok(())
    }

    /// Evaluate all non-expired rules against one client and schedule it
    /// onto every hunt that matched and hasn't already claimed it (§4.6
    /// steps 1-4). Returns the hunt ids newly scheduled this call.
    #[tracing::instrument(skip(self), fields(client_id))]
    pub async fn assign_tasks_to_client(&self, client_id: &str) -> Result<Vec<String>> {
        let foreman_subject = Subject::foreman();
        let now = Utc::now();

        let mut txn = self.datastore.begin_transaction(&foreman_subject).await?;
        let rules = self.load_rules().await?;
        let (active, expired_count): (Vec<ForemanRule>, usize) = {
            let mut active = Vec::new();
            let mut expired = 0;
            for rule in rules {
                if rule.is_expired(now) {
                    expired += 1;
                } else {
                    active.push(rule);
                }
            }
            (active, expired)
        };
        if expired_count > 0 {
            txn.stage_set(RULES_PREDICATE, serde_json::to_vec(&active)?, None, true);
        }
        self.datastore.commit(txn).await?;

        let attrs = attributes::ClientAttributes::load(self.datastore.as_ref(), client_id).await?;
        let mut scheduled = Vec::new();

        for rule in &active {
            if !matcher::rule_set_matches(&self.regex_cache, &rule.client_rule_set, &attrs) {
                continue;
            }
            for action in &rule.actions {
                if self.schedule_client_on_hunt(&action.hunt_id, client_id).await? {
                    scheduled.push(action.hunt_id.clone());
                }
            }
        }

        let client_subject = Subject::client(client_id);
        self.datastore
            .set(&client_subject, "last_foreman_time", now.to_rfc3339().into_bytes(), None, true)
            .await?;

        Ok(scheduled)
    }

    /// Dedupe a client against `hunts/<id>/AllClients` and, if new, queue an
    /// `AddClient` notification for the hunt engine. Returns whether this
    /// call actually scheduled the client (false if already scheduled).
    async fn schedule_client_on_hunt(&self, hunt_id: &str, client_id: &str) -> Result<bool> {
        let hunt_subject = Subject::hunt(hunt_id);
        let marker = format!("AllClients:{client_id}");
        if self.datastore.resolve(&hunt_subject, &marker).await?.is_some() {
            return Ok(false);
        }
        self.datastore.set(&hunt_subject, &marker, Vec::new(), None, true).await?;
        self.queue
            .queue_notification(&hunt_addclient_queue(hunt_id), client_id, Utc::now(), 0)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ranger_datastore::in_memory::InMemoryDatastore;
    use ranger_proto::{ClientRuleClause, ClientRuleSet, ForemanAction};

    fn foreman() -> (Foreman, Arc<InMemoryDatastore>) {
        let ds = Arc::new(InMemoryDatastore::new());
        let qm = Arc::new(QueueManager::new(ds.clone()));
        (Foreman::new(ds.clone(), qm), ds)
    }

    async fn set_os(ds: &InMemoryDatastore, client_id: &str, os: &str) {
        ds.set(&Subject::client(client_id), "attr:os", os.as_bytes().to_vec(), None, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn matching_rule_schedules_hunt_exactly_once() {
        let (foreman, ds) = foreman();
        set_os(&ds, "C.1", "linux").await;

        let rule = ForemanRule {
            created: Utc::now(),
            expires: Utc::now() + Duration::hours(1),
            description: "linux fleet".to_string(),
            client_rule_set: ClientRuleSet {
                clauses: vec![ClientRuleClause::Os { allowed: vec!["linux".to_string()] }],
            },
            actions: vec![ForemanAction { hunt_id: "H:aaa".to_string(), client_limit: None }],
        };
        foreman.install_rule(rule).await.unwrap();

        let scheduled = foreman.assign_tasks_to_client("C.1").await.unwrap();
        assert_eq!(scheduled, vec!["H:aaa".to_string()]);

        let scheduled_again = foreman.assign_tasks_to_client("C.1").await.unwrap();
        assert!(scheduled_again.is_empty(), "a client already scheduled must not be re-queued");
    }

    #[tokio::test]
    async fn expired_rule_is_pruned_and_never_matches() {
        let (foreman, ds) = foreman();
        set_os(&ds, "C.2", "linux").await;

        let rule = ForemanRule {
            created: Utc::now() - Duration::hours(2),
            expires: Utc::now() - Duration::hours(1),
            description: "stale".to_string(),
            client_rule_set: ClientRuleSet { clauses: vec![] },
            actions: vec![ForemanAction { hunt_id: "H:bbb".to_string(), client_limit: None }],
        };
        foreman.install_rule(rule).await.unwrap();

        let scheduled = foreman.assign_tasks_to_client("C.2").await.unwrap();
        assert!(scheduled.is_empty());

        let attr = ds.resolve(&Subject::foreman(), RULES_PREDICATE).await.unwrap().unwrap();
        let rules: Vec<ForemanRule> = serde_json::from_slice(&attr.value).unwrap();
        assert!(rules.is_empty(), "expired rule must be dropped from RULES");
    }

    #[tokio::test]
    async fn non_matching_rule_does_not_schedule() {
        let (foreman, ds) = foreman();
        set_os(&ds, "C.3", "windows").await;

        let rule = ForemanRule {
            created: Utc::now(),
            expires: Utc::now() + Duration::hours(1),
            description: "linux only".to_string(),
            client_rule_set: ClientRuleSet {
                clauses: vec![ClientRuleClause::Os { allowed: vec!["linux".to_string()] }],
            },
            actions: vec![ForemanAction { hunt_id: "H:ccc".to_string(), client_limit: None }],
        };
        foreman.install_rule(rule).await.unwrap();

        let scheduled = foreman.assign_tasks_to_client("C.3").await.unwrap();
        assert!(scheduled.is_empty());
    }
}
