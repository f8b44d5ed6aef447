//! Access control (§4.9): every server operation carries a `Token`, and this
//! crate is where that token is turned into a yes/no against a subject.
//!
//! Approval lookups go through an in-memory, TTL-bounded cache keyed by
//! `(username, target, approval kind)` — the cache only bounds how often the
//! datastore is re-scanned for new approvers; the winning `Approval`'s own
//! `expires` is re-checked on every call regardless of whether the lookup
//! was a cache hit (§4.9, §8 invariant #3).

mod policy;

pub use policy::ClientApprovalAuthorization;

use chrono::Utc;
use moka::future::Cache;
use ranger_datastore::Datastore;
use ranger_flows::registry::{FlowCategory, FlowRegistry};
use ranger_foreman::ClientAttributes;
use ranger_proto::{Approval, Subject, Token};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// The kind of target an `Approval` gates, forming the second half of the
/// cache key alongside `(username, target)` (§4.9 "CheckClientAccess",
/// "CheckHuntAccess", "CheckCronJobAccess").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalKind {
    Client,
    Hunt,
    CronJob,
}

/// `requested_access` for `CheckDataStoreAccess` (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccessMode {
    Read,
    Write,
    Query,
}

const APPROVAL_CACHE_TTL: Duration = Duration::from_secs(60);
const APPROVAL_PREDICATE: &str = "approval";

/// §3 "approver count >= N (configurable, default 2)" — the floor every
/// approval must clear regardless of whether a label policy applies.
const DEFAULT_MIN_APPROVERS: usize = 2;

type CacheKey = (String, String, ApprovalKind);

pub struct AccessManager {
    datastore: Arc<dyn Datastore>,
    cache: Cache<CacheKey, Option<Approval>>,
    /// Label -> multi-party policy (§4.9 "ClientApprovalAuthorization").
    approver_policies: HashMap<String, ClientApprovalAuthorization>,
    min_approvers: usize,
}

impl AccessManager {
    pub fn new(datastore: Arc<dyn Datastore>, approver_policies: HashMap<String, ClientApprovalAuthorization>) -> Self {
        Self {
            datastore,
            cache: Cache::builder().max_capacity(10_000).time_to_live(APPROVAL_CACHE_TTL).build(),
            approver_policies,
            min_approvers: DEFAULT_MIN_APPROVERS,
        }
    }

    /// Override the baseline required-approver count (default 2).
    pub fn with_min_approvers(mut self, min_approvers: usize) -> Self {
        self.min_approvers = min_approvers;
        self
    }

    /// The subject `ACL/<target>/<username>/<reason-hash>` an approval for
    /// `(target, requester, reason)` is persisted under (§6 "Datastore
    /// layout"). `reason` is hashed rather than embedded verbatim since it's
    /// free-text and may contain `/`.
    fn acl_subject(target: &str, requester: &str, reason: &str) -> Subject {
        let digest = Sha256::digest(reason.as_bytes());
        Subject::acl(target, requester, &format!("{digest:x}"))
    }

    /// Persist a brand-new approval request with no approvers yet.
    pub async fn create_approval(&self, approval: &Approval) -> Result<()> {
        let subject = Self::acl_subject(&approval.target, &approval.requester, &approval.reason);
        self.datastore
            .set(&subject, APPROVAL_PREDICATE, serde_json::to_vec(approval)?, None, true)
            .await?;
        Ok(())
    }

    /// Record a new approver against an existing request and invalidate the
    /// cache entry, so the next access check sees the updated approver set
    /// rather than waiting out the TTL (§8 invariant #3, "approver set
    /// satisfying the label policy").
    pub async fn grant_approval(&self, target: &str, requester: &str, reason: &str, approver: &str, kind: ApprovalKind) -> Result<()> {
        let subject = Self::acl_subject(target, requester, reason);
        let Some(attr) = self.datastore.resolve(&subject, APPROVAL_PREDICATE).await? else {
            return Err(AccessError::Unauthorized(format!("no pending approval for `{target}`")));
        };
        let mut approval: Approval = serde_json::from_slice(&attr.value)?;
        approval.add_approver(approver);
        self.datastore
            .set(&subject, APPROVAL_PREDICATE, serde_json::to_vec(&approval)?, None, true)
            .await?;
        self.cache.invalidate(&(requester.to_string(), target.to_string(), kind)).await;
        Ok(())
    }

    /// Every unexpired approval on `target` (a full subject, e.g.
    /// `clients/C.1`) for `username`, freshest scan results cached for
    /// `APPROVAL_CACHE_TTL` (§4.9 "in-memory cache...TTL = 60s").
    async fn best_approval(&self, username: &str, target: &str, kind: ApprovalKind) -> Result<Option<Approval>> {
        let key: CacheKey = (username.to_string(), target.to_string(), kind);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let subjects = self
            .datastore
            .query(&format!("ACL/{target}/{username}"), None, None)
            .await?;

        let mut best: Option<Approval> = None;
        for subject in subjects {
            let Some(attr) = self.datastore.resolve(&subject, APPROVAL_PREDICATE).await? else {
                continue;
            };
            let Ok(approval) = serde_json::from_slice::<Approval>(&attr.value) else {
                continue;
            };
            let replace = match &best {
                Some(b) => approval.expires > b.expires,
                None => true,
            };
            if replace {
                best = Some(approval);
            }
        }

        self.cache.insert(key, best.clone()).await;
        Ok(best)
    }

    /// §8 invariant #3: succeeds iff there's an unexpired approval whose
    /// approver set satisfies the target's label policy, or the token is a
    /// supervisor token. The cached approval's `expires` is re-validated
    /// here regardless of cache freshness — a cache hit never substitutes
    /// for the expiry check.
    async fn check_approval(&self, token: &Token, target: &str, kind: ApprovalKind) -> Result<()> {
        if token.supervisor {
            return Ok(());
        }
        let now = Utc::now();
        let approval = self.best_approval(&token.username, target, kind).await?;
        match approval {
            Some(approval) if approval.is_unexpired(now) && approval.approver_count() >= self.min_approvers => Ok(()),
            _ => Err(AccessError::Unauthorized(format!(
                "no unexpired approval with at least {} approver(s) for `{}` on `{target}`",
                self.min_approvers, token.username
            ))),
        }
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn check_client_access(&self, token: &Token, client_id: &str) -> Result<()> {
        if token.supervisor {
            return Ok(());
        }
        let target = format!("clients/{client_id}");
        let now = Utc::now();
        let approval = self.best_approval(&token.username, &target, ApprovalKind::Client).await?;
        let approval = match approval {
            Some(approval) if approval.is_unexpired(now) && approval.approver_count() >= self.min_approvers => approval,
            _ => {
                return Err(AccessError::Unauthorized(format!(
                    "no unexpired approval with at least {} approver(s) for `{}` on `{client_id}`",
                    self.min_approvers, token.username
                )))
            }
        };
        let attrs = ClientAttributes::load(self.datastore.as_ref(), client_id).await?;
        for label in attrs.labels() {
            if let Some(policy) = self.approver_policies.get(label) {
                if !policy.is_satisfied_by(&approval) {
                    return Err(AccessError::Unauthorized(format!(
                        "approvers for `{client_id}` do not satisfy label `{label}`'s policy"
                    )));
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn check_hunt_access(&self, token: &Token, hunt_id: &str) -> Result<()> {
        self.check_approval(token, &format!("hunts/{hunt_id}"), ApprovalKind::Hunt).await
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn check_cron_job_access(&self, token: &Token, cron_job_id: &str) -> Result<()> {
        self.check_approval(token, &format!("crons/{cron_job_id}"), ApprovalKind::CronJob).await
    }

    /// §4.9 "flow classes are tagged with a category; untagged flows are
    /// refused unless `token.supervisor`". An unregistered flow class is
    /// untagged by definition; a registered `Administrative` flow is
    /// supervisor-only, matching the source's restriction to the worker's
    /// own system identity for maintenance flows.
    #[tracing::instrument(skip(self, token, registry))]
    pub fn check_if_can_start_flow(&self, token: &Token, registry: &FlowRegistry, flow_class_name: &str) -> Result<()> {
        if token.supervisor {
            return Ok(());
        }
        let category = registry
            .get(flow_class_name)
            .map(|descriptor| descriptor.category)
            .ok();
        match category {
            Some(FlowCategory::Administrative) | None => Err(AccessError::Unauthorized(format!(
                "flow class `{flow_class_name}` requires a supervisor token"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// §4.9 "pattern-matched allowlist": a supervisor token may do anything;
    /// anyone may read/write their own `users/<name>/*` tree; everything
    /// else (including the contention-hot `foreman` subject) is
    /// supervisor-only.
    #[tracing::instrument(skip(self, token, subjects))]
    pub fn check_data_store_access(&self, token: &Token, subjects: &[Subject], requested_access: DataAccessMode) -> Result<()> {
        if token.supervisor {
            return Ok(());
        }
        let own_prefix = format!("users/{}", token.username);
        for subject in subjects {
            if subject.starts_with(&own_prefix) {
                continue;
            }
            return Err(AccessError::Unauthorized(format!(
                "`{}` access to `{subject}` requires a supervisor token",
                access_mode_str(requested_access)
            )));
        }
        Ok(())
    }
}

fn access_mode_str(mode: DataAccessMode) -> &'static str {
    match mode {
        DataAccessMode::Read => "read",
        DataAccessMode::Write => "write",
        DataAccessMode::Query => "query",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_datastore::in_memory::InMemoryDatastore;
    use ranger_flows::registry::FlowDescriptor;
    use chrono::Duration as ChronoDuration;

    fn manager(policies: HashMap<String, ClientApprovalAuthorization>) -> (AccessManager, Arc<InMemoryDatastore>) {
        let ds = Arc::new(InMemoryDatastore::new());
        (AccessManager::new(ds.clone(), policies), ds)
    }

    #[tokio::test]
    async fn a_supervisor_token_bypasses_every_check() {
        let (mgr, _ds) = manager(HashMap::new());
        let token = Token::supervisor_token(Utc::now() + ChronoDuration::hours(1));
        assert!(mgr.check_client_access(&token, "C.1").await.is_ok());
        assert!(mgr.check_hunt_access(&token, "H:abc").await.is_ok());
    }

    #[tokio::test]
    async fn an_unapproved_client_is_refused() {
        let (mgr, _ds) = manager(HashMap::new());
        let token = Token::new("alice", "investigating", Utc::now() + ChronoDuration::hours(1));
        let err = mgr.check_client_access(&token, "C.1").await.unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn an_unexpired_approval_grants_access_and_an_expired_one_does_not() {
        let (mgr, _ds) = manager(HashMap::new());
        let now = Utc::now();

        let mut approval = Approval::new("clients/C.1", "alice", "incident 42", now + ChronoDuration::seconds(100));
        approval.add_approver("bob");
        approval.add_approver("carol");
        mgr.create_approval(&approval).await.unwrap();

        let token = Token::new("alice", "incident 42", now + ChronoDuration::hours(1));
        assert!(mgr.check_client_access(&token, "C.1").await.is_ok());

        // A second approval that's already expired must not satisfy the check
        // on its own, proving the cache doesn't just remember "has some approval".
        let mut expired = Approval::new("clients/C.1", "mallory", "stale", now - ChronoDuration::seconds(1));
        expired.add_approver("bob");
        expired.add_approver("carol");
        mgr.create_approval(&expired).await.unwrap();
        let mallory = Token::new("mallory", "stale", now + ChronoDuration::hours(1));
        let err = mgr.check_client_access(&mallory, "C.1").await.unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn a_baseline_of_two_approvers_is_required_even_with_no_label_policy() {
        let (mgr, _ds) = manager(HashMap::new());
        let now = Utc::now();

        let mut approval = Approval::new("hunts/H:aaa", "alice", "r", now + ChronoDuration::hours(1));
        approval.add_approver("bob");
        mgr.create_approval(&approval).await.unwrap();

        let token = Token::new("alice", "r", now + ChronoDuration::hours(1));
        let err = mgr.check_hunt_access(&token, "H:aaa").await.unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized(_)), "a single approver must not satisfy the default baseline of two");

        mgr.grant_approval("hunts/H:aaa", "alice", "r", "carol", ApprovalKind::Hunt).await.unwrap();
        assert!(mgr.check_hunt_access(&token, "H:aaa").await.is_ok(), "a second approver must clear the baseline");
    }

    #[tokio::test]
    async fn a_label_policy_requiring_more_approvers_than_granted_is_refused() {
        let mut policies = HashMap::new();
        policies.insert(
            "sensitive".to_string(),
            ClientApprovalAuthorization {
                required_approvers: vec![],
                required_groups: vec![],
                num_approvers_required: 2,
                requester_must_be_authorized: false,
            },
        );
        let (mgr, ds) = manager(policies);
        let now = Utc::now();

        let subject = Subject::client("C.1");
        ds.set(&subject, "label:sensitive", b"".to_vec(), None, true).await.unwrap();

        let mut approval = Approval::new("clients/C.1", "alice", "r", now + ChronoDuration::hours(1));
        approval.add_approver("bob");
        mgr.create_approval(&approval).await.unwrap();

        let token = Token::new("alice", "r", now + ChronoDuration::hours(1));
        let err = mgr.check_client_access(&token, "C.1").await.unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized(_)), "one approver must not satisfy a policy requiring two");

        mgr.grant_approval("clients/C.1", "alice", "r", "carol", ApprovalKind::Client).await.unwrap();
        assert!(mgr.check_client_access(&token, "C.1").await.is_ok(), "a second approver must satisfy the policy");
    }

    #[tokio::test]
    async fn an_administrative_flow_requires_a_supervisor_token() {
        let (mgr, _ds) = manager(HashMap::new());
        let mut registry = FlowRegistry::new();
        registry.register(FlowDescriptor::new("WipeDisk", FlowCategory::Administrative)).unwrap();
        registry.register(FlowDescriptor::new("ListDirectory", FlowCategory::Collection)).unwrap();

        let token = Token::new("alice", "r", Utc::now() + ChronoDuration::hours(1));
        assert!(mgr.check_if_can_start_flow(&token, &registry, "WipeDisk").is_err());
        assert!(mgr.check_if_can_start_flow(&token, &registry, "ListDirectory").is_ok());
        assert!(mgr.check_if_can_start_flow(&token, &registry, "Nonexistent").is_err(), "an untagged/unknown flow must be refused");
    }

    #[tokio::test]
    async fn datastore_access_is_limited_to_a_users_own_tree() {
        let (mgr, _ds) = manager(HashMap::new());
        let token = Token::new("alice", "r", Utc::now() + ChronoDuration::hours(1));

        let own = Subject::new("users/alice/saved_queries");
        assert!(mgr.check_data_store_access(&token, &[own], DataAccessMode::Read).is_ok());

        let foreman = Subject::foreman();
        assert!(mgr.check_data_store_access(&token, &[foreman], DataAccessMode::Read).is_err());
    }
}
