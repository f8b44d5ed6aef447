//! Worker loop (§4.5): claims queue notifications naming sessions with work
//! ready, and drives each one through the flow runner.
//!
//! Grounded on the claim/dispatch/sleep-on-empty shape of a batch-processing
//! daemon loop: poll a bounded claim, spawn one task per claimed item behind
//! a concurrency limit, and fall back to a fixed sleep when nothing is
//! claimable. The addition this system needs beyond that shape is the lease
//! heartbeat (§5 "a flow runner... refreshes the claim's lease at half the
//! lease interval") so a slow session doesn't have its claim reclaimed out
//! from under it mid-tick.

use chrono::Duration as ChronoDuration;
use ranger_datastore::Datastore;
use ranger_flows::{FlowRegistry, FlowRunner};
use ranger_proto::FlowLifecycle;
use ranger_queue::{AcceptAll, QueueManager};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] ranger_queue::QueueError),
    #[error("flow runner error: {0}")]
    Runner(#[from] ranger_flows::RunnerError),
}

/// Tuning knobs for one worker process (§4.5, §6 "worker --queue").
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub claim_batch_size: usize,
    pub claim_interval: Duration,
    pub lease: ChronoDuration,
    pub concurrency: usize,
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            claim_batch_size: 50,
            claim_interval: Duration::from_millis(200),
            lease: ChronoDuration::seconds(120),
            concurrency: 16,
        }
    }
}

/// A single worker process pulling sessions off one queue.
pub struct Worker {
    datastore: Arc<dyn Datastore>,
    queue: Arc<QueueManager>,
    runner: Arc<FlowRunner>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(datastore: Arc<dyn Datastore>, queue: Arc<QueueManager>, registry: Arc<FlowRegistry>, config: WorkerConfig) -> Self {
        let runner = Arc::new(FlowRunner::new(datastore.clone(), queue.clone(), registry, config.queue.clone()));
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            datastore,
            queue,
            runner,
            config,
            permits,
        }
    }

    /// Run the claim/dispatch loop forever. Returns only if the queue
    /// manager itself errors unrecoverably; per-session failures are caught
    /// and logged, never propagated out of the loop (§4.5 "a failing flow
    /// goes to Error, it does not take the worker down with it").
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("worker starting");
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            while join_set.try_join_next().is_some() {}

            let claims = self
                .queue
                .claim_notifications(&self.config.queue, self.config.lease, &AcceptAll, self.config.claim_batch_size)
                .await?;

            if claims.is_empty() {
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            tracing::debug!(claimed = claims.len(), "claimed session notifications");

            for claim in claims {
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    // At capacity; leave the claim's lease to expire so
                    // another worker (or this one, next tick) retries it.
                    continue;
                };
                let worker = self.clone();
                let session_id = claim.session_id.clone();
                let record_id = claim.record_id.clone();

                join_set.spawn(async move {
                    let _permit = permit;
                    let half_lease = (worker.config.lease / 2).max(ChronoDuration::seconds(1));
                    let heartbeat_queue = worker.queue.clone();
                    let heartbeat_queue_name = worker.config.queue.clone();
                    let heartbeat_record = record_id.clone();
                    let heartbeat_lease = worker.config.lease;
                    let heartbeat_interval = half_lease
                        .to_std()
                        .unwrap_or(Duration::from_secs(60));

                    let heartbeat = tokio::spawn(async move {
                        loop {
                            tokio::time::sleep(heartbeat_interval).await;
                            if heartbeat_queue
                                .refresh_claim(&heartbeat_queue_name, std::slice::from_ref(&heartbeat_record), heartbeat_lease)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });

                    let outcome = worker.runner.run_session(&session_id).await;
                    heartbeat.abort();

                    match outcome {
                        Ok(lifecycle) => {
                            tracing::debug!(session_id = %session_id, ?lifecycle, "session tick complete");
                            if let Err(err) = worker
                                .queue
                                .delete_notifications(&worker.config.queue, &[record_id])
                                .await
                            {
                                tracing::error!(session_id = %session_id, error = %err, "failed to delete claim");
                            }
                        }
                        Err(err) => {
                            // Leave the claim in place; its lease will expire
                            // and another tick will retry the session.
                            tracing::error!(session_id = %session_id, error = %err, "flow runner tick failed");
                        }
                    }
                });
            }
        }
    }
}

/// Whether a session's current lifecycle means a worker should stop polling
/// for it — used by callers driving a session synchronously (e.g. tests,
/// the CLI's `export` path) rather than the steady-state `run` loop.
pub fn is_done(lifecycle: FlowLifecycle) -> bool {
    lifecycle.is_terminal()
}
