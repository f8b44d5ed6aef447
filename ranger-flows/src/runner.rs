//! Flow runner (§4.4): advances one flow session by one worker tick.
//!
//! A tick holds the subject-scoped transaction lock for its whole duration,
//! processes every complete, contiguous `RequestState` starting at
//! `next_processed_request`, and persists the result as a single commit —
//! so a crash mid-tick leaves the flow exactly where it was before the tick
//! started, never half-applied (§4.1, §5).

use crate::registry::{FlowRegistry, RegistryError};
use crate::types::{Action, FlowContext, FlowStateRecord, Responses};
use chrono::Utc;
use ranger_datastore::Datastore;
use ranger_proto::{
    AuthState, ClientResources, FleetMessage, FlowLifecycle, MessageType, Priority, RequestState,
    SessionId, StatusOutcome, Subject, TypedPayload,
};
use ranger_queue::QueueManager;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("queue error: {0}")]
    Queue(#[from] ranger_queue::QueueError),
    #[error("state lookup failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("payload encoding error: {0}")]
    Payload(#[from] ranger_proto::payload::PayloadError),
    #[error("flow session `{0}` has no `task:state`")]
    MissingState(String),
}

/// The client action-request queue a `CallClient` lands on, named after the
/// client itself so the frontend can claim it per-client (§4.8, §6).
fn client_queue_name(client_id: &str) -> String {
    format!("C.{client_id}")
}

pub struct FlowRunner {
    datastore: Arc<dyn Datastore>,
    queue: Arc<QueueManager>,
    registry: Arc<FlowRegistry>,
    worker_queue: String,
}

impl FlowRunner {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queue: Arc<QueueManager>,
        registry: Arc<FlowRegistry>,
        worker_queue: impl Into<String>,
    ) -> Self {
        Self {
            datastore,
            queue,
            registry,
            worker_queue: worker_queue.into(),
        }
    }

    /// Advance `session_id` by one tick, returning its lifecycle after the
    /// tick. A no-op tick (nothing complete to process) still round-trips
    /// through commit so the caller's lease management stays uniform.
    #[tracing::instrument(skip(self), fields(session_id))]
    pub async fn run_session(&self, session_id: &str) -> Result<FlowLifecycle> {
        let subject = Subject::flow(session_id);
        let mut txn = self.datastore.begin_transaction(&subject).await?;

        let state_attr = self
            .datastore
            .resolve(&subject, "task:state")
            .await?
            .ok_or_else(|| RunnerError::MissingState(session_id.to_string()))?;
        let mut state: FlowStateRecord = serde_json::from_slice(&state_attr.value)?;

        if state.lifecycle.is_terminal() {
            self.datastore.commit(txn).await?;
            return Ok(state.lifecycle);
        }

        // A parent hunt stopped mid-run (§4.7 "Stop"): abort this child's
        // next state rather than running it, regardless of what's pending.
        if let Some(reason) = state.pending_termination.clone() {
            state.lifecycle = FlowLifecycle::Error;
            state.backtrace = Some(reason);
            txn.stage_set("task:state", serde_json::to_vec(&state)?, None, true);
            self.datastore.commit(txn).await?;
            self.notify_parent_of_termination(&state).await?;
            return Ok(state.lifecycle);
        }

        let request_attrs = self
            .datastore
            .resolve_regex(&subject, "^task:request_", ranger_proto::ReadMode::Newest, None)
            .await?;
        let mut pending: Vec<RequestState> = request_attrs
            .iter()
            .filter_map(|attr| serde_json::from_slice::<RequestState>(&attr.value).ok())
            .filter(|request| request.is_complete())
            .collect();
        pending.sort_by_key(|request| request.request_id);

        let mut spawned_children: Vec<(String, TypedPayload, u64, Option<String>)> = Vec::new();
        let mut outbound: Vec<(String, FleetMessage)> = Vec::new();
        let mut hunt_replies: Vec<(String, u64, TypedPayload)> = Vec::new();
        // Requests staged for deletion this tick but not yet committed — the
        // drain check below must treat these as gone even though a fresh
        // read of the committed store still sees them (§4.4 step 4).
        let mut retired_this_tick: std::collections::HashSet<u64> = std::collections::HashSet::new();

        for request in pending {
            // Invariant: a state runs only once its predecessor has been
            // fully processed and removed (§8 invariant #1). A gap here
            // means an older request is still outstanding; stop and wait.
            if request.request_id != state.next_processed_request {
                break;
            }
            // Every path below retires this request exactly once before the
            // loop moves past it, so it's gone as of this tick even though
            // the commit that removes it hasn't landed yet.
            retired_this_tick.insert(request.request_id);

            if let Some(status) = &request.status {
                let used = ClientResources {
                    cpu_usage: status.cpu_time_used,
                    network_bytes_sent: status.network_bytes_sent,
                };
                state.client_resources.add(used);

                // A non-OK STATUS is not decided here: the waiting state is
                // invoked below with `responses.success == false` and either
                // handles it or returns `Action::Error` to propagate it
                // (§4.4 step 4, §7 "handled by the state or propagated as
                // flow ERROR").
                if let Some(limit) = state.cpu_limit {
                    if state.client_resources.cpu_usage > limit {
                        state.lifecycle = FlowLifecycle::Error;
                        state.backtrace = Some(format!(
                            "CPU limit exceeded: used {:.3} of {:.3}",
                            state.client_resources.cpu_usage, limit
                        ));
                        self.retire_request(&mut txn, &subject, &request).await?;
                        state.next_processed_request += 1;
                        break;
                    }
                }
                if let Some(limit) = state.network_bytes_limit {
                    if state.client_resources.network_bytes_sent > limit {
                        state.lifecycle = FlowLifecycle::Error;
                        state.backtrace = Some(format!(
                            "network byte limit exceeded: used {} of {}",
                            state.client_resources.network_bytes_sent, limit
                        ));
                        self.retire_request(&mut txn, &subject, &request).await?;
                        state.next_processed_request += 1;
                        break;
                    }
                }
            }

            let response_attrs = self
                .datastore
                .resolve_regex(
                    &subject,
                    &format!("^task:response_{}_", request.request_id),
                    ranger_proto::ReadMode::Newest,
                    None,
                )
                .await?;
            let mut numbered: Vec<(u64, TypedPayload)> = response_attrs
                .iter()
                .filter_map(|attr| serde_json::from_slice::<FleetMessage>(&attr.value).ok())
                .map(|msg| (msg.response_id, msg.payload))
                .collect();
            numbered.sort_by_key(|(id, _)| *id);

            let responses = Responses {
                request_id: request.request_id,
                success: request.status.as_ref().map(|s| s.ok).unwrap_or(true),
                backtrace: request.status.as_ref().and_then(|s| s.backtrace.clone()),
                request_data: request.data.clone(),
                payloads: numbered.into_iter().map(|(_, payload)| payload).collect(),
            };

            let state_fn = self.registry.state_fn(&state.flow_class_name, &request.next_state)?;
            let mut ctx = FlowContext {
                args: &state.args,
                user_state: &mut state.user_state,
                responses,
            };

            // A state method failing is a flow bug, not a runner fault: the
            // session goes to Error, the worker keeps going (§9 redesign
            // note: fail the flow, not the process).
            let actions = match state_fn(&mut ctx) {
                Ok(actions) => actions,
                Err(message) => {
                    state.lifecycle = FlowLifecycle::Error;
                    state.backtrace = Some(message);
                    self.retire_request(&mut txn, &subject, &request).await?;
                    state.next_processed_request += 1;
                    break;
                }
            };

            for action in actions {
                match action {
                    Action::SendReply(payload) => {
                        let predicate = format!("results:{}", state.next_result_index);
                        txn.stage_set(predicate, serde_json::to_vec(&payload)?, None, false);
                        if let Some(parent) = &state.parent_session_id {
                            if ranger_proto::is_hunt_session(parent) {
                                hunt_replies.push((parent.clone(), state.next_result_index, payload));
                            }
                        }
                        state.next_result_index += 1;
                    }
                    Action::Log(message) => {
                        tracing::info!(session_id, flow_message = %message, "flow log");
                    }
                    Action::CallClient {
                        action_name,
                        payload,
                        next_state,
                        request_data,
                    } => {
                        let client_id = state
                            .client_id
                            .clone()
                            .expect("CallClient issued from a flow with no client_id");
                        let new_request_id = state.next_outbound_id;
                        state.next_outbound_id += 1;

                        let mut new_request = RequestState::new(new_request_id, next_state, Some(client_id.clone()));
                        new_request.data = request_data;
                        txn.stage_set(
                            format!("task:request_{new_request_id}"),
                            serde_json::to_vec(&new_request)?,
                            None,
                            true,
                        );

                        let message = FleetMessage {
                            session_id: session_id.to_string(),
                            request_id: new_request_id,
                            response_id: 1,
                            name: action_name,
                            auth_state: AuthState::Authenticated,
                            priority: Priority::Medium,
                            message_type: MessageType::Message,
                            payload,
                            cpu_limit: state.cpu_limit,
                            network_bytes_limit: state.network_bytes_limit,
                        };
                        outbound.push((client_queue_name(&client_id), message));
                    }
                    Action::CallFlow {
                        flow_class,
                        args,
                        next_state,
                    } => {
                        // A child flow reports back through a request slot on
                        // this session, same as a CallClient would, so its
                        // eventual STATUS drives `next_state` here.
                        let new_request_id = state.next_outbound_id;
                        state.next_outbound_id += 1;
                        let new_request = RequestState::new(new_request_id, next_state, None);
                        txn.stage_set(
                            format!("task:request_{new_request_id}"),
                            serde_json::to_vec(&new_request)?,
                            None,
                            true,
                        );
                        spawned_children.push((flow_class, args, new_request_id, state.client_id.clone()));
                    }
                    Action::CallState {
                        payloads,
                        next_state,
                        start_time: _,
                    } => {
                        // Self-call: synthesize a fresh request/response pair
                        // in the same session so the next tick drives the
                        // named state with these payloads as its responses.
                        let new_request_id = state.next_outbound_id;
                        state.next_outbound_id += 1;
                        let mut synthetic = RequestState::new(new_request_id, next_state, None);
                        synthetic.status = Some(StatusOutcome {
                            response_id: payloads.len() as u64 + 1,
                            ok: true,
                            backtrace: None,
                            cpu_time_used: 0.0,
                            network_bytes_sent: 0,
                        });
                        synthetic.response_count = payloads.len() as u64;
                        for (i, payload) in payloads.iter().enumerate() {
                            let response_id = i as u64 + 1;
                            let msg = FleetMessage {
                                session_id: session_id.to_string(),
                                request_id: new_request_id,
                                response_id,
                                name: String::new(),
                                auth_state: AuthState::Authenticated,
                                priority: Priority::Medium,
                                message_type: MessageType::Message,
                                payload: payload.clone(),
                                cpu_limit: None,
                                network_bytes_limit: None,
                            };
                            txn.stage_set(
                                format!("task:response_{new_request_id}_{response_id}"),
                                serde_json::to_vec(&msg)?,
                                None,
                                false,
                            );
                        }
                        txn.stage_set(
                            format!("task:request_{new_request_id}"),
                            serde_json::to_vec(&synthetic)?,
                            None,
                            true,
                        );
                        self.queue
                            .queue_notification(&self.worker_queue, session_id, Utc::now(), 0)
                            .await?;
                    }
                    Action::Terminate => {
                        state.lifecycle = FlowLifecycle::Terminated;
                    }
                    Action::Error(message) => {
                        state.lifecycle = FlowLifecycle::Error;
                        state.backtrace = Some(message);
                    }
                }
            }

            self.retire_request(&mut txn, &subject, &request).await?;
            state.next_processed_request += 1;

            if state.lifecycle.is_terminal() {
                break;
            }
        }

        // No outstanding requests and nobody ended the flow explicitly means
        // the flow ran off the end of its state chain (§4.4 "drain check").
        if !state.lifecycle.is_terminal() {
            let still_outstanding = self
                .datastore
                .resolve_regex(&subject, "^task:request_", ranger_proto::ReadMode::Newest, None)
                .await?;
            let still_pending = still_outstanding.iter().any(|attr| {
                match attr.predicate.strip_prefix("task:request_").and_then(|id| id.parse::<u64>().ok()) {
                    Some(id) => !retired_this_tick.contains(&id),
                    None => true,
                }
            });
            if !still_pending {
                state.lifecycle = FlowLifecycle::Terminated;
            }
        }

        txn.stage_set("task:state", serde_json::to_vec(&state)?, None, true);
        self.datastore.commit(txn).await?;

        if state.lifecycle.is_terminal() {
            self.notify_parent_of_termination(&state).await?;
        }

        for (hunt_id, result_index, payload) in hunt_replies {
            let hunt_subject = Subject::hunt(&hunt_id);
            let now_us = Utc::now().timestamp_micros();
            let predicate = format!("pending_result:{now_us:020}:{session_id}:{result_index}");
            self.datastore
                .set(&hunt_subject, &predicate, serde_json::to_vec(&payload)?, Some(now_us), false)
                .await?;
            self.queue
                .queue_notification(&ranger_proto::hunt_results_queue(&hunt_id), session_id, Utc::now(), 0)
                .await?;
        }

        for (queue, message) in outbound {
            let target = Subject::queue(&queue);
            self.datastore
                .set(
                    &target,
                    &format!("msg:{}:{}", message.session_id, message.request_id),
                    serde_json::to_vec(&message)?,
                    None,
                    true,
                )
                .await?;
            self.queue.queue_notification(&queue, &message.session_id, Utc::now(), 0).await?;
        }

        for (flow_class, args, parent_request_id, client_id) in spawned_children {
            let child_id = SessionId::new_flow("F");
            let mut child_state = FlowStateRecord::new(
                child_id.as_str().to_string(),
                flow_class,
                state.creator.clone(),
                args.json.clone(),
                client_id,
                Some(session_id.to_string()),
                state.cpu_limit,
                state.network_bytes_limit,
            );
            child_state.parent_request_id = Some(parent_request_id);
            let child_subject = Subject::flow(child_id.as_str());
            self.datastore
                .set(&child_subject, "task:state", serde_json::to_vec(&child_state)?, None, true)
                .await?;
            self.queue
                .queue_notification(&self.worker_queue, child_id.as_str(), Utc::now(), 0)
                .await?;
        }

        Ok(state.lifecycle)
    }

    /// Deliver a terminated flow's outcome to whatever spawned it: a hunt
    /// gets a `pending_status:` record on its own subject (it has no
    /// `task:request_` slots), a parent flow gets its matching request's
    /// status patched directly, bypassing the inbound-message router since
    /// this delivery never crosses a client boundary.
    async fn notify_parent_of_termination(&self, state: &FlowStateRecord) -> Result<()> {
        let Some(parent) = &state.parent_session_id else {
            return Ok(());
        };
        let status = StatusOutcome {
            response_id: 1,
            ok: state.lifecycle == FlowLifecycle::Terminated,
            backtrace: state.backtrace.clone(),
            cpu_time_used: state.client_resources.cpu_usage,
            network_bytes_sent: state.client_resources.network_bytes_sent,
        };

        if ranger_proto::is_hunt_session(parent) {
            let hunt_subject = Subject::hunt(parent);
            let now_us = Utc::now().timestamp_micros();
            let predicate = format!("pending_status:{now_us:020}:{}", state.session_id);
            self.datastore
                .set(&hunt_subject, &predicate, serde_json::to_vec(&status)?, Some(now_us), false)
                .await?;
            self.queue
                .queue_notification(&ranger_proto::hunt_status_queue(parent), &state.session_id, Utc::now(), 0)
                .await?;
            return Ok(());
        }

        let Some(parent_request_id) = state.parent_request_id else {
            return Ok(());
        };
        let parent_subject = Subject::flow(parent);
        let mut txn = self.datastore.begin_transaction(&parent_subject).await?;
        let predicate = format!("task:request_{parent_request_id}");
        match self.datastore.resolve(&parent_subject, &predicate).await? {
            Some(attr) => {
                let mut request: RequestState = serde_json::from_slice(&attr.value)?;
                request.status = Some(status);
                txn.stage_set(predicate, serde_json::to_vec(&request)?, None, true);
                self.datastore.commit(txn).await?;
                self.queue
                    .queue_notification(&self.worker_queue, parent, Utc::now(), 0)
                    .await?;
            }
            None => {
                self.datastore.commit(txn).await?;
            }
        }
        Ok(())
    }

    async fn retire_request(
        &self,
        txn: &mut ranger_datastore::Transaction,
        subject: &Subject,
        request: &RequestState,
    ) -> Result<()> {
        txn.stage_delete(format!("task:request_{}", request.request_id));
        let response_attrs = self
            .datastore
            .resolve_regex(
                subject,
                &format!("^task:response_{}_", request.request_id),
                ranger_proto::ReadMode::Newest,
                None,
            )
            .await?;
        for attr in response_attrs {
            txn.stage_delete(attr.predicate);
        }
        Ok(())
    }
}
