//! Message router (§4.3): correlates an inbound client message with the
//! `RequestState` a flow session is waiting on, and decides when a request
//! has collected everything it promised.

use chrono::Utc;
use ranger_datastore::Datastore;
use ranger_proto::{FleetMessage, RequestState, StatusOutcome, Subject};
use ranger_queue::QueueManager;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("queue error: {0}")]
    Queue(#[from] ranger_queue::QueueError),
    #[error("payload decoding error: {0}")]
    Payload(#[from] ranger_proto::payload::PayloadError),
    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("session `{0}` has no open request {1}")]
    UnknownRequest(String, u64),
}

/// Whether delivering one message made its request complete (§4.3: "A
/// request is complete once its STATUS has arrived and every response it
/// promised has also arrived").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Complete,
    StillPending,
}

/// Routes inbound client traffic onto the per-flow request ledger and wakes
/// the worker pool once a request is ready to be processed.
pub struct MessageRouter {
    datastore: Arc<dyn Datastore>,
    queue: Arc<QueueManager>,
    worker_queue: String,
}

impl MessageRouter {
    pub fn new(datastore: Arc<dyn Datastore>, queue: Arc<QueueManager>, worker_queue: impl Into<String>) -> Self {
        Self {
            datastore,
            queue,
            worker_queue: worker_queue.into(),
        }
    }

    /// Deliver one inbound message for `msg.session_id` / `msg.request_id`.
    /// STATUS messages close out the request; anything else is stored as a
    /// numbered response and bumps `response_count` (§3 "RequestState").
    #[tracing::instrument(skip(self, msg), fields(session_id = %msg.session_id, request_id = msg.request_id))]
    pub async fn route_inbound(&self, msg: FleetMessage) -> Result<RouteOutcome> {
        let subject = Subject::flow(&msg.session_id);
        let request_predicate = format!("task:request_{}", msg.request_id);

        let mut txn = self.datastore.begin_transaction(&subject).await?;
        let existing = self.datastore.resolve(&subject, &request_predicate).await?;
        let mut request: RequestState = match existing {
            Some(attr) => serde_json::from_slice(&attr.value)?,
            None => return Err(RouterError::UnknownRequest(msg.session_id, msg.request_id)),
        };

        if msg.is_status() {
            let status: StatusOutcome = msg.payload.decode("StatusOutcome")?;
            request.status = Some(status);
        } else {
            let response_predicate = format!("task:response_{}_{}", msg.request_id, msg.response_id);
            txn.stage_set(response_predicate, serde_json::to_vec(&msg)?, None, false);
            request.response_count += 1;
        }

        let complete = request.is_complete();
        txn.stage_set(request_predicate, serde_json::to_vec(&request)?, None, true);
        self.datastore.commit(txn).await?;

        if complete {
            self.queue
                .queue_notification(&self.worker_queue, &msg.session_id, Utc::now(), 0)
                .await?;
            Ok(RouteOutcome::Complete)
        } else {
            Ok(RouteOutcome::StillPending)
        }
    }

    /// Whether an outbound request may still be retransmitted to a client
    /// that hasn't replied (§3 "RequestState.transmission_count", capped at
    /// `RequestState::MAX_TRANSMISSIONS`).
    pub fn can_retransmit(request: &RequestState) -> bool {
        request.can_retransmit()
    }
}
