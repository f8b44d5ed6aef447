//! Queue manager (§4.2): a FIFO of work notifications with visibility
//! timeouts, built on top of `ranger-datastore`.
//!
//! Each queue is a subject whose attributes are pending notifications,
//! keyed by a deterministic record id so that `queue_notification` is
//! idempotent for identical `(session_id, eligible_after)` pairs. Claiming
//! stamps a lease (`leased_until`); a claim is only eligible if unleased or
//! its lease has expired, which gives the "lease dies, work gets
//! re-dispatched" failure semantics §4.2 requires.

use chrono::{DateTime, Duration, Utc};
use ranger_datastore::Datastore;
use ranger_proto::{ReadMode, Subject};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("notification encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

const NOTIFY_PREFIX: &str = "notify:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNotification {
    session_id: String,
    eligible_after: DateTime<Utc>,
    priority: i32,
    leased_until: Option<DateTime<Utc>>,
}

/// An identified, claimed queue notification (§4.2 "Returning a claim
/// `(record_id, timestamp, suffix)` uniquely identifies the queued item").
#[derive(Debug, Clone)]
pub struct Claim {
    pub record_id: String,
    pub session_id: String,
    pub eligible_after: DateTime<Utc>,
    pub priority: i32,
}

fn record_id_for(queue: &str, session_id: &str, eligible_after: DateTime<Utc>) -> String {
    let mut hasher = DefaultHasher::new();
    (queue, session_id, eligible_after.timestamp_micros()).hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// A filter narrowing which queued notifications `claim` is willing to take,
/// used by the hunt-result processor to scope a claim to one hunt (§4.7).
pub trait ClaimFilter: Send + Sync {
    fn accepts(&self, session_id: &str) -> bool;
}

pub struct AcceptAll;
impl ClaimFilter for AcceptAll {
    fn accepts(&self, _session_id: &str) -> bool {
        true
    }
}

/// Stops accepting as soon as a notification belonging to a different hunt
/// is seen — the source's "first-hunt-wins" fairness policy (§4.7, §9 open
/// question: round-robin fairness across hunts is not implemented here).
pub struct FirstMatchFilter {
    pub prefix: String,
}
impl ClaimFilter for FirstMatchFilter {
    fn accepts(&self, session_id: &str) -> bool {
        session_id.starts_with(&self.prefix)
    }
}

pub struct QueueManager {
    datastore: Arc<dyn Datastore>,
}

impl QueueManager {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Append a pending notification. Idempotent: calling this twice with an
    /// identical `(queue, session_id, eligible_after)` triple collides onto
    /// the same record (§4.2 "QueueNotification ... idempotent within a
    /// single transaction").
    #[tracing::instrument(skip(self))]
    pub async fn queue_notification(
        &self,
        queue: &str,
        session_id: &str,
        eligible_after: DateTime<Utc>,
        priority: i32,
    ) -> Result<String> {
        let subject = Subject::queue(queue);
        let record_id = record_id_for(queue, session_id, eligible_after);
        let notification = StoredNotification {
            session_id: session_id.to_string(),
            eligible_after,
            priority,
            leased_until: None,
        };
        self.datastore
            .set(
                &subject,
                &format!("{NOTIFY_PREFIX}{record_id}"),
                serde_json::to_vec(&notification)?,
                None,
                true,
            )
            .await?;
        Ok(record_id)
    }

    /// Atomically select up to `limit` eligible, unleased notifications and
    /// stamp them with `leased_until = now + lease` (§4.2 "ClaimNotifications").
    #[tracing::instrument(skip(self, filter))]
    pub async fn claim_notifications(
        &self,
        queue: &str,
        lease: Duration,
        filter: &dyn ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Claim>> {
        let subject = Subject::queue(queue);
        let now = Utc::now();

        let mut txn = self.datastore.begin_transaction(&subject).await?;
        let attrs = self
            .datastore
            .resolve_regex(&subject, &format!("^{NOTIFY_PREFIX}"), ReadMode::Newest, None)
            .await?;

        let mut candidates: Vec<(String, StoredNotification)> = attrs
            .into_iter()
            .filter_map(|attr| {
                let notification: StoredNotification = serde_json::from_slice(&attr.value).ok()?;
                let record_id = attr.predicate.strip_prefix(NOTIFY_PREFIX)?.to_string();
                Some((record_id, notification))
            })
            .filter(|(_, n)| n.eligible_after <= now)
            .filter(|(_, n)| n.leased_until.map(|until| until <= now).unwrap_or(true))
            .filter(|(_, n)| filter.accepts(&n.session_id))
            .collect();

        candidates.sort_by(|a, b| {
            b.1.priority
                .cmp(&a.1.priority)
                .then(a.1.eligible_after.cmp(&b.1.eligible_after))
        });
        candidates.truncate(limit);

        let mut claims = Vec::with_capacity(candidates.len());
        for (record_id, mut notification) in candidates {
            notification.leased_until = Some(now + lease);
            txn.stage_set(
                format!("{NOTIFY_PREFIX}{record_id}"),
                serde_json::to_vec(&notification)?,
                None,
                true,
            );
            claims.push(Claim {
                record_id,
                session_id: notification.session_id,
                eligible_after: notification.eligible_after,
                priority: notification.priority,
            });
        }

        if let Err(err) = self.datastore.commit(txn).await {
            match err {
                ranger_datastore::DatastoreError::TransactionConflict(_) => {
                    // Someone else claimed from this queue concurrently;
                    // the caller's next poll will pick up whatever remains.
                    return Ok(Vec::new());
                }
                other => return Err(other.into()),
            }
        }

        Ok(claims)
    }

    /// Remove notifications after successful processing (§4.2 "DeleteNotifications").
    pub async fn delete_notifications(&self, queue: &str, record_ids: &[String]) -> Result<()> {
        let subject = Subject::queue(queue);
        let predicates: Vec<String> = record_ids.iter().map(|id| format!("{NOTIFY_PREFIX}{id}")).collect();
        self.datastore.delete_attributes(&subject, &predicates).await?;
        Ok(())
    }

    /// Extend the lease on claimed notifications (§4.2 "RefreshClaim"), the
    /// worker heartbeat primitive (§4.5, §5).
    pub async fn refresh_claim(&self, queue: &str, record_ids: &[String], lease: Duration) -> Result<()> {
        let subject = Subject::queue(queue);
        let now = Utc::now();
        for record_id in record_ids {
            let predicate = format!("{NOTIFY_PREFIX}{record_id}");
            if let Some(attr) = self.datastore.resolve(&subject, &predicate).await? {
                if let Ok(mut notification) = serde_json::from_slice::<StoredNotification>(&attr.value) {
                    notification.leased_until = Some(now + lease);
                    self.datastore
                        .set(&subject, &predicate, serde_json::to_vec(&notification)?, None, true)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

// Exposed for callers that want the datastore's broader read modes, e.g.
// auditing every version of a notification rather than just the newest.
pub use ranger_datastore::DatastoreError;
pub type QueueReadMode = ReadMode;

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_datastore::in_memory::InMemoryDatastore;

    fn manager() -> QueueManager {
        QueueManager::new(Arc::new(InMemoryDatastore::new()))
    }

    #[tokio::test]
    async fn claim_respects_eligible_after() {
        let qm = manager();
        let now = Utc::now();
        qm.queue_notification("W", "F:aaa", now + Duration::seconds(60), 0)
            .await
            .unwrap();
        let claims = qm
            .claim_notifications("W", Duration::seconds(600), &AcceptAll, 10)
            .await
            .unwrap();
        assert!(claims.is_empty(), "notification not yet eligible must not be claimed");
    }

    #[tokio::test]
    async fn claim_then_lease_hides_from_other_workers() {
        let qm = manager();
        let now = Utc::now();
        qm.queue_notification("W", "F:bbb", now, 0).await.unwrap();

        let first = qm
            .claim_notifications("W", Duration::seconds(600), &AcceptAll, 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = qm
            .claim_notifications("W", Duration::seconds(600), &AcceptAll, 10)
            .await
            .unwrap();
        assert!(second.is_empty(), "leased notification must not be reclaimed");
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let qm = manager();
        let now = Utc::now();
        qm.queue_notification("W", "F:ccc", now, 0).await.unwrap();
        qm.claim_notifications("W", Duration::milliseconds(-1), &AcceptAll, 10)
            .await
            .unwrap();

        let reclaimed = qm
            .claim_notifications("W", Duration::seconds(600), &AcceptAll, 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1, "an expired lease must be reclaimable");
    }

    #[tokio::test]
    async fn repeated_enqueue_is_idempotent() {
        let qm = manager();
        let now = Utc::now();
        let id_a = qm.queue_notification("W", "F:ddd", now, 0).await.unwrap();
        let id_b = qm.queue_notification("W", "F:ddd", now, 0).await.unwrap();
        assert_eq!(id_a, id_b);

        let claims = qm
            .claim_notifications("W", Duration::seconds(600), &AcceptAll, 10)
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
    }
}
